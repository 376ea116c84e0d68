//! Engine: single serialized worker around the session registry.
//!
//! All mutation goes through one mpsc command channel drained by a worker
//! task that owns the [`SessionRegistry`]. Timers are detached tasks that
//! sleep and enqueue a command; they never touch session state themselves,
//! so an expired-but-stale timer is a cheap no-op in the worker rather than
//! a race.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::CreateError;
use crate::registry::{RegistryStats, RouteCallbacks, SessionRegistry};
use crate::session::Session;
use crate::transport::{InboundSink, Transport};
use crate::types::{SessionConfig, SessionKey};

enum Command {
    Create {
        config: SessionConfig,
        reply: oneshot::Sender<Result<u32, CreateError>>,
    },
    Destroy {
        key: SessionKey,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        key: SessionKey,
        reply: oneshot::Sender<Option<Session>>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    TxDue {
        key: SessionKey,
        generation: u64,
    },
    RxExpired {
        key: SessionKey,
        generation: u64,
        epoch: u64,
    },
    Inbound {
        key: SessionKey,
        generation: u64,
        raw: Vec<u8>,
    },
}

/// Handle to a running BFD engine. Cheap to clone; all clones talk to the
/// same worker.
#[derive(Clone)]
pub struct BfdEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl BfdEngine {
    /// Starts the engine worker.
    pub fn new(callbacks: Arc<dyn RouteCallbacks>, transport: Arc<dyn Transport>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            registry: SessionRegistry::new(callbacks),
            transport,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(worker.run());
        Self { cmd_tx }
    }

    /// Creates a session toward `config.key` and starts monitoring it.
    /// Returns the session's local discriminator.
    pub async fn create(&self, config: SessionConfig) -> Result<u32, CreateError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Create { config, reply })
            .map_err(|_| CreateError::EngineShutdown)?;
        rx.await.map_err(|_| CreateError::EngineShutdown)?
    }

    /// Stops monitoring `key`. Returns false if it was not monitored (or
    /// the engine has shut down).
    pub async fn destroy(&self, key: &SessionKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Destroy {
                key: key.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Snapshot of one session.
    pub async fn lookup(&self, key: &SessionKey) -> Option<Session> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Lookup {
                key: key.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> RegistryStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats { reply }).is_err() {
            return RegistryStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Tears down every session (final packets included) and stops the
    /// worker. Completes once the worker has drained.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Worker {
    registry: SessionRegistry,
    transport: Arc<dyn Transport>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    async fn run(mut self) {
        debug!("engine worker started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Create { config, reply } => {
                    let result = self.handle_create(config).await;
                    let _ = reply.send(result);
                }
                Command::Destroy { key, reply } => {
                    let _ = reply.send(self.registry.destroy(&key));
                }
                Command::Lookup { key, reply } => {
                    let _ = reply.send(self.registry.lookup(&key));
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.registry.stats());
                }
                Command::Shutdown { reply } => {
                    self.registry.shutdown_all();
                    let _ = reply.send(());
                    break;
                }
                Command::TxDue { key, generation } => {
                    if let Some(delay_us) = self.registry.on_transmit_due(&key, generation) {
                        self.arm_tx(key, generation, delay_us);
                    }
                }
                Command::RxExpired {
                    key,
                    generation,
                    epoch,
                } => {
                    if let Some((delay_us, epoch)) =
                        self.registry.on_detect_timeout(&key, generation, epoch)
                    {
                        self.arm_rx(key, generation, epoch, delay_us);
                    }
                }
                Command::Inbound {
                    key,
                    generation,
                    raw,
                } => {
                    // A datagram delivered by a replaced session's socket
                    // must not reach the successor session.
                    if self.registry.generation_of(&key) != Some(generation) {
                        continue;
                    }
                    if let Some((delay_us, epoch)) = self.registry.on_packet(&key, &raw) {
                        self.arm_rx(key, generation, epoch, delay_us);
                    }
                }
            }
        }
        debug!("engine worker stopped");
    }

    async fn handle_create(&mut self, config: SessionConfig) -> Result<u32, CreateError> {
        let key = config.key.clone();
        let local_addr = config.local_addr;
        // Register first so a duplicate create fails while the socket is
        // still being opened.
        let discriminator = self.registry.create(config)?;
        let generation = match self.registry.generation_of(&key) {
            Some(generation) => generation,
            None => return Err(CreateError::EngineShutdown),
        };

        let sink = self.inbound_sink(key.clone(), generation);
        match self.transport.open(&key, local_addr, sink).await {
            Ok(transport) => {
                self.registry.attach_transport(&key, transport);
                // First control packet goes out right away; the cycle
                // self-schedules from there.
                let _ = self.cmd_tx.send(Command::TxDue { key, generation });
                Ok(discriminator)
            }
            Err(e) => {
                error!(key = %key, error = %e, "transport open failed");
                self.registry.destroy(&key);
                Err(e.into())
            }
        }
    }

    fn inbound_sink(&self, key: SessionKey, generation: u64) -> InboundSink {
        let cmd_tx = self.cmd_tx.clone();
        Arc::new(move |raw| {
            let _ = cmd_tx.send(Command::Inbound {
                key: key.clone(),
                generation,
                raw,
            });
        })
    }

    fn arm_tx(&self, key: SessionKey, generation: u64, delay_us: u64) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(delay_us)).await;
            let _ = cmd_tx.send(Command::TxDue { key, generation });
        });
    }

    fn arm_rx(&self, key: SessionKey, generation: u64, epoch: u64, delay_us: u32) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(u64::from(delay_us))).await;
            let _ = cmd_tx.send(Command::RxExpired {
                key,
                generation,
                epoch,
            });
        });
    }
}
