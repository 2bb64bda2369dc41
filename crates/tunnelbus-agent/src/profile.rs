//! The signed-in profile the worker waits for

use tokio::sync::watch;
use tunnelbus_proto::ExposedProject;

/// Identity of the user whose projects are tunneled
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub username: String,
    pub projects: Vec<ExposedProject>,
}

impl Profile {
    pub fn new(username: impl Into<String>, projects: Vec<ExposedProject>) -> Self {
        Self {
            username: username.into(),
            projects,
        }
    }
}

/// Channel carrying the profile once sign-in completes
///
/// The receiver starts out empty; publishing `Some(profile)` is the ready signal.
pub fn profile_channel() -> (watch::Sender<Option<Profile>>, watch::Receiver<Option<Profile>>) {
    watch::channel(None)
}
