pub mod alloc_guard;
pub mod channel;
pub mod contract;
pub mod loops;
pub mod os;
pub mod sync;
mod test;
pub mod thread;
pub mod utils;

pub mod prelude;
