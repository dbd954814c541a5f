use std::sync::Arc;

/// Runtime I/O failure recorded on a resource. These never halt the queue or
/// sibling resources; an errored resource still counts toward drain.
#[derive(Debug, Clone)]
pub enum LoadError {
    Transport(String),
    Timeout,
    MalformedJson(Arc<serde_json::Error>),
    MalformedText(Arc<std::string::FromUtf8Error>),
    // A middleware stage dropped its continuation without advancing
    StalledPipeline(&'static str),
    Cancelled,
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadError::Transport(_) => None,
            LoadError::Timeout => None,
            LoadError::MalformedJson(ref e) => Some(&**e),
            LoadError::MalformedText(ref e) => Some(&**e),
            LoadError::StalledPipeline(_) => None,
            LoadError::Cancelled => None,
        }
    }
}

impl core::fmt::Display for LoadError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            LoadError::Transport(ref msg) => write!(fmt, "transport failure: {}", msg),
            LoadError::Timeout => write!(fmt, "transport timed out"),
            LoadError::MalformedJson(ref e) => write!(fmt, "malformed json payload: {}", e),
            LoadError::MalformedText(ref e) => write!(fmt, "malformed text payload: {}", e),
            LoadError::StalledPipeline(phase) => {
                write!(fmt, "middleware stage in {} phase dropped its continuation", phase)
            }
            LoadError::Cancelled => write!(fmt, "load cancelled"),
        }
    }
}

/// Programmer error, surfaced synchronously at the call site rather than
/// queued or deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    DuplicateResourceName(String),
    MissingUrl(String),
    AddWhileLoadingRequiresParent(String),
    UnknownParentResource(String),
}

impl std::error::Error for LoaderError {}

impl core::fmt::Display for LoaderError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            LoaderError::DuplicateResourceName(ref name) => {
                write!(fmt, "a resource named '{}' is already registered", name)
            }
            LoaderError::MissingUrl(ref name) => {
                write!(fmt, "resource '{}' was added without a url", name)
            }
            LoaderError::AddWhileLoadingRequiresParent(ref name) => {
                write!(
                    fmt,
                    "resource '{}' added while loading without a parent resource",
                    name
                )
            }
            LoaderError::UnknownParentResource(ref name) => {
                write!(fmt, "parent resource for '{}' is not registered", name)
            }
        }
    }
}
