pub mod cache;
pub mod config;
pub mod controller;
pub mod exception;
pub mod handler;
pub mod param;
pub mod path;
pub mod request;
pub mod resolver;
pub mod response;
pub mod session;
pub mod timeout;
pub mod util;

pub use cache::FileCache;
pub use config::Config;
pub use controller::{Dispatch, FrontController};
pub use exception::Exception;
pub use handler::{CgiHandler, Handler, HandlerContext, HandlerOutput};
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use path::{PathKind, PathNormalizer, RequestPath};
pub use request::Request;
pub use resolver::{RouteMatch, RouteOutcome, RouteTable};
pub use response::Response;
pub use session::{FileSessionStore, MemorySessionStore, SessionState, SessionStore};
pub use timeout::{ExpiryReason, SessionTimeout, TimeoutDecision, TimeoutPolicy, TimeoutStatus};
pub use util::HtmlBuilder;
