mod sunela_lib;

pub use sunela_lib::*;
