pub mod hashing;

mod handle;
pub use handle::ResourceHandle;

pub mod task_queue;
pub use task_queue::TaskQueue;
pub use task_queue::TaskToken;
