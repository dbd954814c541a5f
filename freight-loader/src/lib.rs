//! Asset-loading pipeline for a cooperatively scheduled game engine.
//!
//! The pieces, leaves first:
//! - `TaskQueue` (in freight-base): concurrency-limited FIFO scheduler over
//!   opaque items, no resource knowledge.
//! - `Resource`: state machine for one named loadable unit.
//! - Middleware: pre-load and post-load stage series run per resource.
//! - `Loader`: owns the registry, wires resources into the queue, runs the
//!   middleware, accounts progress, detects aggregate completion.
//! - `ReferenceResolver`: post-completion pass rewriting tagged ext/sub
//!   references inside loaded composite data into live links.
//!
//! Everything is driven from `Loader::update`: transports and middleware
//! stages report back through one event channel, and all registry mutation
//! happens while draining it. A resource always runs pre stages, then its
//! transport, then post stages, in strict series; distinct resources
//! interleave freely up to the queue's concurrency cap.

mod error;
pub use error::LoadError;
pub use error::LoaderError;

pub mod resource;
pub use resource::{LoadKind, LoadState, Resource, ResourceData, ResourceType, ResponseKind};

pub mod transport;
pub use transport::{MemoryTransport, Transport, TransportRequest, TransportResult};

pub mod middleware;
pub use middleware::{LoadStage, Phase, StageToken};

pub mod loader;
pub use loader::{
    AddItem, AddOptions, Loader, LoaderConfig, LoaderEvent, LoaderNotification,
};

pub mod resolve;
pub use resolve::{Constructed, ConstructorTable, ReferenceResolver, Resolved};

pub use freight_base::ResourceHandle;
