//! Command Dispatcher
//!
//! Executes `connect`, `disconnect`, `move` and `led` against the registry
//! and the transport. Successful results are only echoed when the request
//! asked for them; errors always are.

use super::{CommandError, Relay};
use crate::device::{ConnectOutcome, LedColor};
use crate::protocol::{Command, CommandRequest, CommandResult, ServerMessage};

impl Relay {
    pub(crate) async fn handle_command(&self, request: CommandRequest) -> Option<ServerMessage> {
        let result = match self.execute_command(&request).await {
            Ok(message) => CommandResult::success(&request, message),
            Err(e) => {
                tracing::debug!(
                    cmd = ?request.cmd,
                    device = ?request.target,
                    error = %e,
                    "Command failed"
                );
                CommandResult::error(&request, e.to_string())
            }
        };

        if result.is_error() || request.wants_ack() {
            Some(ServerMessage::Result(result))
        } else {
            None
        }
    }

    /// Run a command, returning an optional success message
    async fn execute_command(&self, request: &CommandRequest) -> Result<Option<String>, CommandError> {
        let command = request.command()?;
        if command == Command::Unknown {
            return Err(CommandError::UnknownCommand);
        }
        let target = request
            .target
            .as_deref()
            .ok_or(CommandError::MissingTarget)?;

        match command {
            Command::Connect => match self.registry.connect(target).await? {
                ConnectOutcome::Connected => Ok(None),
                ConnectOutcome::AlreadyConnected => Ok(Some("Device already connected".to_string())),
            },
            Command::Disconnect => {
                self.registry.disconnect(target).await?;
                Ok(None)
            }
            Command::Move(params) => {
                let handle = self
                    .registry
                    .handle(target)
                    .await
                    .ok_or(crate::device::RegistryError::NotConnected)?;
                self.transport
                    .set_motor(&handle, params.left_speed, params.right_speed)
                    .await
                    .map_err(|e| {
                        tracing::warn!(device = %target, error = %e, "Motor command failed");
                        CommandError::Motor
                    })?;
                Ok(None)
            }
            Command::Led(params) => {
                let handle = self
                    .registry
                    .handle(target)
                    .await
                    .ok_or(crate::device::RegistryError::NotConnected)?;
                let color = LedColor {
                    r: params.r,
                    g: params.g,
                    b: params.b,
                };
                self.transport.set_led(&handle, color).await.map_err(|e| {
                    tracing::warn!(device = %target, error = %e, "LED command failed");
                    CommandError::Led
                })?;
                Ok(None)
            }
            Command::Unknown => Err(CommandError::UnknownCommand),
        }
    }
}
