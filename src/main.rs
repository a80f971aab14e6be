use std::env::set_var;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction, ArgMatches, Command};
use log::*;

use sunela::flash_driver::file::FileFlashDriver;
use sunela::otp;
use sunela::pin::pin_encode;
use sunela::{DbEntry, FieldType, Vault, MASTER_SECRET_BYTES};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-d --device <FILE> "Storage file")
                .required(false)
                .default_value("_storage"),
        )
        .arg(arg!(-p --pin <PIN> "PIN unlocking the vault").required(false))
        .arg(
            arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                .action(ArgAction::SetTrue)
                .required(false),
        )
        .subcommand(
            Command::new("init")
                .about("Initialize the storage file and set the PIN")
                .arg(arg!(--force "Wipe storage that is already in use").action(ArgAction::SetTrue)),
        )
        .subcommand(Command::new("ls").about("List entries"))
        .subcommand(
            Command::new("show")
                .about("Show one entry")
                .arg(arg!(<name> "Entry name"))
                .arg(arg!(--reveal "Also print secret fields").action(ArgAction::SetTrue)),
        )
        .subcommand(
            Command::new("add")
                .about("Create an entry")
                .arg(arg!(<name> "Entry name"))
                .arg(arg!(--dir "Create a directory entry").action(ArgAction::SetTrue)),
        )
        .subcommand(
            Command::new("set")
                .about("Set a field")
                .arg(arg!(<name> "Entry name"))
                .arg(arg!(<field> "user, email, pw, pw2, comment, hotp_secret, hotp_counter, totp_secret"))
                .arg(arg!(<value> "Field value; OTP secrets in base32")),
        )
        .subcommand(
            Command::new("del")
                .about("Delete a field, or the whole entry")
                .arg(arg!(<name> "Entry name"))
                .arg(arg!([field] "Field to delete")),
        )
        .subcommand(
            Command::new("mv")
                .about("Rename an entry")
                .arg(arg!(<name> "Current name"))
                .arg(arg!(<new_name> "New name")),
        )
        .subcommand(
            Command::new("passwd")
                .about("Change the PIN")
                .arg(arg!(<new_pin> "New PIN, 4-8 digits")),
        )
        .subcommand(
            Command::new("otp")
                .about("Print the current OTP code for an entry")
                .arg(arg!(<name> "Entry name")),
        )
        .subcommand(Command::new("stats").about("Print block statistics"))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();

    let device = matches.get_one::<String>("device").unwrap();
    info!("Device: {}", device);

    // On real hardware this comes out of protected storage at boot.
    let device_secret = [0u8; MASTER_SECRET_BYTES];
    let mut vault = Vault::new(Box::new(FileFlashDriver::new()), device_secret);
    vault.open_storage(device)?;

    let pin = match matches.get_one::<String>("pin") {
        Some(s) => Some(pin_encode(s)?),
        None => None,
    };
    let need_pin = || pin.ok_or(anyhow!("a PIN is required, pass -p <PIN>"));

    match matches.subcommand() {
        Some(("init", sub)) => {
            if !vault.is_erased()? {
                if !sub.get_flag("force") {
                    return Err(anyhow!("{} is already in use, use --force to wipe it", device));
                }
                warn!("wiping {}", device);
                vault.erase_all()?;
            }
            vault.set_pin(need_pin()?)?;
            vault.open()?;
            println!("{} initialized", device);
            return Ok(());
        }
        Some(("passwd", sub)) => {
            let old_pin = need_pin()?;
            let new_pin = pin_encode(sub.get_one::<String>("new_pin").unwrap())?;
            // load the active pad under the old PIN before rewriting it
            vault.login(old_pin)?;
            vault.change_pin(old_pin, new_pin)?;
            println!("PIN changed");
            return Ok(());
        }
        _ => (),
    }

    vault.login(need_pin()?)?;
    vault.open_progress(|i, n| {
        if i + 1 == n {
            debug!("scanned {} blocks", n);
        }
    })?;

    match matches.subcommand() {
        Some(("ls", _)) => {
            vault.iterate(|e| {
                println!("{}{}", e.name, if e.is_dir() { "/" } else { "" });
                true
            });
        }
        Some(("show", sub)) => {
            let idx = find(&vault, sub)?;
            let reveal = sub.get_flag("reveal");
            let entry = vault.entry(idx).unwrap();
            println!("{}{}", entry.name, if entry.is_dir() { "/" } else { "" });
            for f in &entry.fields {
                match f.ft {
                    FieldType::Id | FieldType::Dir => (),
                    FieldType::HotpCounter => {
                        let mut c = [0u8; 8];
                        c.copy_from_slice(&f.data);
                        println!("  {}: {}", f.ft.name(), u64::from_le_bytes(c));
                    }
                    FieldType::HotpSecret | FieldType::TotpSecret => {
                        if reveal {
                            println!("  {}: {}", f.ft.name(), otp::base32_encode(&f.data));
                        } else {
                            println!("  {}: ***", f.ft.name());
                        }
                    }
                    _ => {
                        if f.ft.is_secret() && !reveal {
                            println!("  {}: ***", f.ft.name());
                        } else {
                            println!("  {}: {}", f.ft.name(), String::from_utf8_lossy(&f.data));
                        }
                    }
                }
            }
        }
        Some(("add", sub)) => {
            let name = sub.get_one::<String>("name").unwrap();
            if sub.get_flag("dir") {
                vault.mkdir(name)?;
            } else {
                vault.new_entry(name)?;
            }
        }
        Some(("set", sub)) => {
            let idx = find(&vault, sub)?;
            let field = sub.get_one::<String>("field").unwrap();
            let value = sub.get_one::<String>("value").unwrap();
            let ft = FieldType::from_name(field)
                .ok_or_else(|| anyhow!("unknown field: {}", field))?;
            let data = match ft {
                FieldType::HotpSecret | FieldType::TotpSecret => otp::base32_decode(value)?,
                FieldType::HotpCounter => value.parse::<u64>()?.to_le_bytes().to_vec(),
                _ => value.as_bytes().to_vec(),
            };
            vault.change_field(idx, ft, &data)?;
        }
        Some(("del", sub)) => {
            let idx = find(&vault, sub)?;
            match sub.get_one::<String>("field") {
                Some(field) => {
                    let ft = FieldType::from_name(field)
                        .ok_or_else(|| anyhow!("unknown field: {}", field))?;
                    vault.delete_field(idx, ft)?;
                }
                None => vault.delete_entry(idx)?,
            }
        }
        Some(("mv", sub)) => {
            let idx = find(&vault, sub)?;
            vault.rename(idx, sub.get_one::<String>("new_name").unwrap())?;
        }
        Some(("otp", sub)) => {
            let idx = find(&vault, sub)?;
            println!("{:06}", otp_code(&mut vault, idx)?);
        }
        Some(("stats", _)) | None => {
            let stats = vault.stats();
            println!(
                "total {}  data {}  erased {}  deleted {}  empty {}  invalid {}  error {}  special {}",
                stats.total,
                stats.data,
                stats.erased,
                stats.deleted,
                stats.empty,
                stats.invalid,
                stats.error,
                stats.special
            );
            println!("generation {}", vault.generation());
        }
        Some((cmd, _)) => return Err(anyhow!("unhandled command {}", cmd)),
    }
    Ok(())
}

fn find(vault: &Vault, sub: &ArgMatches) -> Result<usize> {
    let name = sub.get_one::<String>("name").unwrap();
    vault
        .find(name)
        .ok_or_else(|| anyhow!("no such entry: {}", name))
}

/// TOTP if the entry has a TOTP secret, else HOTP with counter post-increment.
fn otp_code(vault: &mut Vault, idx: usize) -> Result<u32> {
    let entry: &DbEntry = vault.entry(idx).unwrap();
    if let Some(f) = entry.field(FieldType::TotpSecret) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        return Ok(otp::totp_code(&f.data, now));
    }
    let secret = match entry.field(FieldType::HotpSecret) {
        Some(f) => f.data.clone(),
        None => return Err(anyhow!("entry has no OTP secret")),
    };
    let counter = match entry.field(FieldType::HotpCounter) {
        Some(f) => {
            let mut c = [0u8; 8];
            c.copy_from_slice(&f.data);
            u64::from_le_bytes(c)
        }
        None => 0,
    };
    let code = otp::hotp_code(&secret, counter);
    vault.change_field(
        idx,
        FieldType::HotpCounter,
        &(counter + 1).to_le_bytes(),
    )?;
    Ok(code)
}
