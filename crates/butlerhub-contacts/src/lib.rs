//! Contact directory: the shared `contacts`/`contact_channels` tables and
//! the channel-identity resolution the approval gate and messenger adapters
//! depend on.
//!
//! | module        | responsibility                                       |
//! |---------------|-------------------------------------------------------|
//! | `db`          | migrations + typed row access for `contacts`/`contact_channels` |
//! | `resolver`    | `ContactDirectory`, implementing `butlerhub_approval::ContactResolver` |
//! | `permissions` | role checks for editing the directory itself           |

pub mod db;
pub mod error;
pub mod permissions;
pub mod resolver;
pub mod types;

pub use error::{ContactError, Result};
pub use permissions::{ContactAction, PermissionCheck, PermissionChecker};
pub use resolver::ContactDirectory;
pub use types::{Contact, ContactChannel, NewContact};
