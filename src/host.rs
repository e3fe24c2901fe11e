use crate::protocol::{HostCommand, TabId};
use thiserror::Error;
use tokio::sync::broadcast;

const HOST_COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no browser shim is attached")]
    Detached,
}

/// Browser-level side effects the coordinator cannot perform itself.
pub trait BrowserHost: Send + Sync {
    fn redirect_tab(&self, tab_id: TabId, url: &str) -> Result<(), HostError>;
    fn notify(&self, title: &str, message: &str) -> Result<(), HostError>;
    /// Loads the observer program into a tab that is not answering.
    fn inject_observer(&self, tab_id: TabId) -> Result<(), HostError>;
}

/// Forwards host commands to the extension's background shim, which
/// subscribes over the `/v1/host` event stream.
#[derive(Clone)]
pub struct ShimHost {
    commands: broadcast::Sender<HostCommand>,
}

impl ShimHost {
    pub fn new() -> Self {
        let (commands, _) = broadcast::channel(HOST_COMMAND_CAPACITY);
        Self { commands }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostCommand> {
        self.commands.subscribe()
    }

    fn send(&self, command: HostCommand) -> Result<(), HostError> {
        self.commands
            .send(command)
            .map(|_| ())
            .map_err(|_| HostError::Detached)
    }
}

impl Default for ShimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserHost for ShimHost {
    fn redirect_tab(&self, tab_id: TabId, url: &str) -> Result<(), HostError> {
        self.send(HostCommand::RedirectTab {
            tab_id,
            url: url.to_string(),
        })
    }

    fn notify(&self, title: &str, message: &str) -> Result<(), HostError> {
        self.send(HostCommand::Notify {
            title: title.to_string(),
            message: message.to_string(),
        })
    }

    fn inject_observer(&self, tab_id: TabId) -> Result<(), HostError> {
        self.send(HostCommand::InjectObserver { tab_id })
    }
}
