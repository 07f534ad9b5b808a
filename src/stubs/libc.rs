//! libc stub families. Everything here follows the standard stub shape: read
//! the argument registers, apply the side effect against emulator memory, set
//! X0, fake a RET.

pub mod fileio;
pub mod locale;
pub mod memory;
pub mod printf;
pub mod string;
pub mod system;
pub mod time;

pub(crate) fn register() {
    memory::register();
    string::register();
    time::register();
    locale::register();
    fileio::register();
    printf::register();
    system::register();
}
