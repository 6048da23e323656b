pub mod dispatcher;
pub mod handler;

pub use dispatcher::{CompletionDispatcher, PollSummary};
pub use handler::FragmentHandler;
