//! Document sessions and the cache that hands them out.
//!
//! Every consumer of a document goes through [`SessionCache`]. The first
//! access of a document creates its [`DocumentSession`], subscribes to the
//! remote document and returns a [`Suspension`]; once the load settles, the
//! next access returns a [`Subscription`]. Dropping the last subscription
//! unsubscribes, destroys the remote document and evicts the session.

mod cache;
mod document;
mod registry;
mod subscription;

pub use cache::SessionCache;
pub use document::{Access, DocumentSession, SessionStatus};
pub use registry::SessionRegistry;
pub use subscription::{Dispatcher, Subscription, Suspension};
