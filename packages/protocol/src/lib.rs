pub mod command;
pub mod config;
pub mod error;
pub mod phonebook;
pub mod profile;
pub mod registers;
pub mod result_code;

pub use command::{Command, Dial, DialTarget};
pub use config::{Config, DtrAction, LinePolicy};
pub use error::ModemError;
pub use phonebook::{Entry, Phonebook, Protocol};
pub use profile::{Profile, StoredProfiles};
pub use registers::Registers;
pub use result_code::ResultCode;
