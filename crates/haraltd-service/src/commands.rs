//! Client command tree and its dispatch.
//!
//! Requests arrive as argument vectors without a program name, e.g.
//! `["device", "opp", "send-file", "-a", "AA:BB:CC:DD:EE:FF", "-f", "a.txt"]`,
//! and are parsed with clap.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{ColorChoice, Parser, Subcommand};
use tracing::debug;

use haraltd_core::{
    AgentKind, AuthenticationBroker, BluetoothStack, CommandHandler, CommandOutcome, Error,
    ObjectPush, OperationToken,
};
use haraltd_types::{BluetoothAddress, ErrorCode, ErrorData, PlatformInfo, ResultData};

/// Features reported by `rpc feature-flags`.
pub const FEATURES: [&str; 2] = ["send_file", "receive_file"];

#[derive(Debug, Parser)]
#[command(
    name = "haraltd",
    no_binary_name = true,
    disable_help_subcommand = true,
    color = ColorChoice::Never
)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Daemon information and client registration
    Rpc {
        #[command(subcommand)]
        command: RpcCommand,
    },
    /// Operations on a remote device
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    /// Operations on the local adapter
    Adapter {
        #[command(subcommand)]
        command: AdapterCommand,
    },
    /// Shortcuts for Object Push
    Opp {
        #[command(subcommand)]
        command: OppShortcut,
    },
}

#[derive(Debug, Subcommand)]
enum RpcCommand {
    /// Daemon version
    Version,
    /// Bluetooth backend and operating system
    PlatformInfo,
    /// Features this daemon supports
    FeatureFlags,
    /// Answer an authentication prompt
    Auth {
        /// Prompt id from the authentication event
        #[arg(short = 'a', long = "auth-id")]
        auth_id: u64,
        /// The answer, e.g. `yes` or a pincode
        #[arg(short = 'r', long)]
        response: String,
    },
    /// Claim or give up an agent slot
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AgentCommand {
    /// Route prompts of one kind to this client
    Register {
        /// `pairing` or `obex`
        #[arg(short = 'a', long = "agent")]
        kind: AgentKind,
    },
    /// Stop routing prompts of one kind to this client
    Unregister {
        #[arg(short = 'a', long = "agent")]
        kind: AgentKind,
    },
}

#[derive(Debug, Subcommand)]
enum DeviceCommand {
    /// Object Push client sessions
    Opp {
        #[command(subcommand)]
        command: OppCommand,
    },
}

#[derive(Debug, Subcommand)]
enum OppCommand {
    /// Connect to a device's Object Push service
    StartSession {
        #[arg(short, long)]
        address: BluetoothAddress,
    },
    /// Queue a file on an open session
    SendFile {
        #[arg(short, long)]
        address: BluetoothAddress,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Abort the transfer in flight
    CancelTransfer {
        #[arg(short, long)]
        address: BluetoothAddress,
    },
    SuspendTransfer {
        #[arg(short, long)]
        address: Option<BluetoothAddress>,
    },
    ResumeTransfer {
        #[arg(short, long)]
        address: Option<BluetoothAddress>,
    },
    /// Disconnect the session
    StopSession {
        #[arg(short, long)]
        address: BluetoothAddress,
    },
}

#[derive(Debug, Subcommand)]
enum AdapterCommand {
    /// The local Object Push server
    OppServer {
        #[command(subcommand)]
        command: OppServerCommand,
    },
}

#[derive(Debug, Subcommand)]
enum OppServerCommand {
    /// Accept inbound pushes
    Start {
        /// Where received files are stored
        #[arg(short = 'd', long = "directory")]
        directory: Option<PathBuf>,
    },
    Stop,
}

#[derive(Debug, Subcommand)]
enum OppShortcut {
    /// Send a file, opening a session first if needed
    Send {
        #[arg(short, long)]
        address: BluetoothAddress,
        file: PathBuf,
    },
}

/// Runs client commands against the daemon's components.
pub struct Commands {
    broker: Arc<AuthenticationBroker>,
    opp: Arc<ObjectPush>,
    stack: Arc<dyn BluetoothStack>,
}

impl Commands {
    pub fn new(
        broker: Arc<AuthenticationBroker>,
        opp: Arc<ObjectPush>,
        stack: Arc<dyn BluetoothStack>,
    ) -> Self {
        Self { broker, opp, stack }
    }

    async fn rpc(&self, token: &OperationToken, command: RpcCommand) -> CommandOutcome {
        match command {
            RpcCommand::Version => Ok(Some(ResultData::Version(
                env!("CARGO_PKG_VERSION").to_string(),
            ))),
            RpcCommand::PlatformInfo => Ok(Some(ResultData::Platform(PlatformInfo {
                stack: self.stack.name().to_string(),
                os_info: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            }))),
            RpcCommand::FeatureFlags => Ok(Some(ResultData::Features(
                FEATURES.iter().map(|f| f.to_string()).collect(),
            ))),
            RpcCommand::Auth { auth_id, response } => {
                let client_id = token.client_id().ok_or(Error::NoClientId)?;
                if self.broker.set_event_response(client_id, auth_id, &response) {
                    Ok(None)
                } else {
                    Err(Error::unexpected(format!(
                        "No pending authentication event with id {auth_id}"
                    ))
                    .into())
                }
            }
            RpcCommand::Agent { command } => {
                match command {
                    AgentCommand::Register { kind } => {
                        self.broker.register_agent(kind, token.client_id())?
                    }
                    AgentCommand::Unregister { kind } => {
                        self.broker.unregister_agent(kind, token.client_id())?
                    }
                }
                Ok(None)
            }
        }
    }

    async fn device_opp(&self, token: &OperationToken, command: OppCommand) -> CommandOutcome {
        match command {
            OppCommand::StartSession { address } => {
                self.opp.start_session(token, address).await?;
                Ok(None)
            }
            OppCommand::SendFile { address, file } => {
                let transfer = self.opp.queue_file(token, address, &file).await?;
                Ok(Some(ResultData::FileTransfer(transfer)))
            }
            OppCommand::CancelTransfer { address } => {
                self.opp.cancel_transfer(token, address)?;
                Ok(None)
            }
            OppCommand::StopSession { address } => {
                self.opp.stop_session(token, address).await?;
                Ok(None)
            }
            OppCommand::SuspendTransfer { .. } => {
                Err(Error::Unsupported("Suspending a transfer".into()).into())
            }
            OppCommand::ResumeTransfer { .. } => {
                Err(Error::Unsupported("Resuming a transfer".into()).into())
            }
        }
    }

    async fn opp_server(&self, token: &OperationToken, command: OppServerCommand) -> CommandOutcome {
        match command {
            OppServerCommand::Start { directory } => {
                self.opp.start_server(token, directory).await?;
            }
            OppServerCommand::Stop => self.opp.stop_server(token).await?,
        }
        Ok(None)
    }

    async fn send(
        &self,
        token: &OperationToken,
        address: BluetoothAddress,
        file: PathBuf,
    ) -> CommandOutcome {
        if let Err(Error::NoSession { .. }) = self.opp.client_session(token, address) {
            self.opp.start_session(token, address).await?;
        }
        let transfer = self.opp.queue_file(token, address, &file).await?;
        Ok(Some(ResultData::FileTransfer(transfer)))
    }
}

#[async_trait]
impl CommandHandler for Commands {
    async fn handle(&self, token: &OperationToken, command: &[String]) -> CommandOutcome {
        let parsed = match CommandLine::try_parse_from(command) {
            Ok(parsed) => parsed,
            Err(e) => return Err(parse_error(&e)),
        };
        debug!(operation_id = token.operation_id(), command = ?parsed.command, "Running command");

        match parsed.command {
            Command::Rpc { command } => self.rpc(token, command).await,
            Command::Device {
                command: DeviceCommand::Opp { command },
            } => self.device_opp(token, command).await,
            Command::Adapter {
                command: AdapterCommand::OppServer { command },
            } => self.opp_server(token, command).await,
            Command::Opp {
                command: OppShortcut::Send { address, file },
            } => self.send(token, address, file).await,
        }
    }
}

fn parse_error(e: &clap::Error) -> ErrorData {
    ErrorData::from(ErrorCode::ParsingCommand).with_metadata("exception", e.to_string().trim_end())
}
