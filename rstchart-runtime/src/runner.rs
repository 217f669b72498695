//! Real-time runner.
//!
//! The interpreter never sleeps: its clock only moves when told to. The
//! runner owns that decision. A tokio interval advances the simulated clock
//! by the wall-clock time elapsed since the previous tick, scaled by
//! `clock.speed`. Inputs arrive as commands through a [`RunnerHandle`] and
//! are serialised with the ticks by the interpreter's mutex.

use crate::config::Config;
use crate::error::RuntimeError;
use parking_lot::Mutex;
use rstchart_core::{ChartError, Checkpoint, Event, Interpreter, MacroStep, Model};
use rstchart_storage::{CheckpointMeta, CheckpointPolicy, CheckpointStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum Command {
    Fire {
        event: Event,
        reply: Reply<Vec<MacroStep>>,
    },
    Advance {
        delta: f64,
        reply: Reply<Vec<MacroStep>>,
    },
    Checkpoint {
        reply: Reply<CheckpointMeta>,
    },
    Shutdown,
}

/// Loads the interpreter for a runtime: resumes the session's latest
/// checkpoint when enabled and compatible, otherwise starts fresh.
pub fn load_interpreter(
    model: Arc<Model>,
    config: &Config,
    store: Option<&CheckpointStore>,
) -> Result<Interpreter, RuntimeError> {
    let options = config.engine.options();
    if let (Some(store), true) = (store, config.checkpoint.resume) {
        let session = &config.checkpoint.session;
        if let Some(meta) = store.latest_meta(session) {
            if meta.model == model.name() && meta.model_checksum == model.checksum() {
                let checkpoint = store.load(&meta.checkpoint_id)?;
                let interpreter =
                    Interpreter::restore_with_options(model, &checkpoint, options)?;
                tracing::info!(
                    "Resumed session {} from checkpoint {} (t={})",
                    session,
                    meta.checkpoint_id,
                    meta.time
                );
                return Ok(interpreter);
            }
            tracing::warn!(
                "Latest checkpoint of session {} is for another model version, starting fresh",
                session
            );
        }
    }
    Ok(Interpreter::with_options(model, options)?)
}

/// Drives one interpreter in real time.
pub struct Runner {
    interpreter: Arc<Mutex<Interpreter>>,
    commands: mpsc::Receiver<Command>,
    store: Option<Arc<CheckpointStore>>,
    policy: CheckpointPolicy,
    session: String,
    keep: usize,
    tick: Duration,
    speed: f64,
    steps_since_checkpoint: u64,
}

/// Cloneable command side of a [`Runner`].
#[derive(Clone)]
pub struct RunnerHandle {
    interpreter: Arc<Mutex<Interpreter>>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

impl Runner {
    /// Wraps an interpreter. Emitted events are republished on a broadcast
    /// channel available from the handle.
    pub fn new(
        mut interpreter: Interpreter,
        config: &Config,
        store: Option<Arc<CheckpointStore>>,
    ) -> (Self, RunnerHandle) {
        let (events, _) = broadcast::channel(config.output.channel_capacity.max(1));
        let sender = events.clone();
        interpreter.subscribe(move |e| {
            // no receiver is fine
            let _ = sender.send(e.clone());
        });

        let interpreter = Arc::new(Mutex::new(interpreter));
        let (tx, rx) = mpsc::channel(64);

        let policy = if store.is_some() {
            config.checkpoint.policy()
        } else {
            CheckpointPolicy::Never
        };

        let runner = Self {
            interpreter: Arc::clone(&interpreter),
            commands: rx,
            store,
            policy,
            session: config.checkpoint.session.clone(),
            keep: config.checkpoint.keep,
            tick: config.clock.tick(),
            speed: config.clock.speed,
            steps_since_checkpoint: 0,
        };
        let handle = RunnerHandle {
            interpreter,
            commands: tx,
            events,
        };
        (runner, handle)
    }

    /// Runs until shutdown is requested, every handle is dropped, or the
    /// statechart reaches a final state.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        tracing::info!(
            "Runner started (tick={}ms, speed={}, checkpoints={:?})",
            self.tick.as_millis(),
            self.speed,
            self.policy
        );

        loop {
            if self.interpreter.lock().is_final() {
                tracing::info!("Statechart reached a final state");
                break;
            }

            tokio::select! {
                now = ticker.tick() => {
                    let delta = now.duration_since(last_tick).as_secs_f64() * self.speed;
                    last_tick = now;
                    let result = self.interpreter.lock().advance_time(delta);
                    if let Err(e) = self.record(result) {
                        tracing::warn!("Clock tick failed: {}", e);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Fire { event, reply }) => {
                        let result = self.interpreter.lock().fire(event);
                        let _ = reply.send(self.record(result));
                    }
                    Some(Command::Advance { delta, reply }) => {
                        let result = self.interpreter.lock().advance_time(delta);
                        let _ = reply.send(self.record(result));
                    }
                    Some(Command::Checkpoint { reply }) => {
                        let _ = reply.send(self.save_checkpoint());
                    }
                    Some(Command::Shutdown) | None => {
                        tracing::info!("Runner shutting down");
                        break;
                    }
                },
            }
        }

        if self.policy.on_shutdown() {
            self.save_checkpoint()?;
        }
        tracing::info!("Runner stopped");
        Ok(())
    }

    /// Counts macrosteps toward the checkpoint policy.
    fn record(
        &mut self,
        result: Result<Vec<MacroStep>, ChartError>,
    ) -> Result<Vec<MacroStep>, RuntimeError> {
        let trace = result?;
        self.steps_since_checkpoint += trace.iter().filter(|m| !m.is_empty()).count() as u64;
        if self.policy.is_due(self.steps_since_checkpoint) {
            if let Err(e) = self.save_checkpoint() {
                tracing::error!("Periodic checkpoint failed: {}", e);
            }
        }
        Ok(trace)
    }

    fn save_checkpoint(&mut self) -> Result<CheckpointMeta, RuntimeError> {
        let store = self.store.as_ref().ok_or(RuntimeError::CheckpointDisabled)?;
        let checkpoint = self.interpreter.lock().checkpoint();
        let meta = store.save(&self.session, &checkpoint)?;
        if self.keep > 0 {
            store.prune(&self.session, self.keep)?;
        }
        self.steps_since_checkpoint = 0;
        Ok(meta)
    }
}

impl RunnerHandle {
    /// Sends an event and waits for the resulting macrosteps.
    pub async fn fire(&self, event: impl Into<Event>) -> Result<Vec<MacroStep>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Fire {
            event: event.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Advances the simulated clock on top of the real-time ticks.
    pub async fn advance(&self, delta: f64) -> Result<Vec<MacroStep>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Advance { delta, reply }).await?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Writes a checkpoint now.
    pub async fn checkpoint(&self) -> Result<CheckpointMeta, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Checkpoint { reply }).await?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Asks the runner to stop. It checkpoints first if its policy says so.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Receives every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Reads interpreter state without going through the command queue.
    pub fn inspect<R>(&self, f: impl FnOnce(&Interpreter) -> R) -> R {
        f(&self.interpreter.lock())
    }

    /// Captures the interpreter state without storing it.
    pub fn snapshot(&self) -> Checkpoint {
        self.interpreter.lock().checkpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstchart_core::Value;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn model(name: &str) -> Arc<Model> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../models")
            .join(name);
        Arc::new(Model::from_file(path).unwrap())
    }

    /// A config whose ticks are too rare to matter.
    fn manual_config() -> Config {
        let mut config = Config::default();
        config.clock.tick_ms = 3_600_000;
        config
    }

    fn start(
        model: Arc<Model>,
        config: &Config,
        store: Option<Arc<CheckpointStore>>,
    ) -> (RunnerHandle, tokio::task::JoinHandle<Result<(), RuntimeError>>) {
        let interpreter = load_interpreter(model, config, store.as_deref()).unwrap();
        let (runner, handle) = Runner::new(interpreter, config, store);
        (handle, tokio::spawn(runner.run()))
    }

    #[tokio::test]
    async fn test_fire_and_advance() {
        let (handle, task) = start(model("stopwatch.yaml"), &manual_config(), None);

        handle.fire("start").await.unwrap();
        let trace = handle.advance(1.0).await.unwrap();
        assert!(!trace.is_empty());
        let elapsed = handle.inspect(|it| it.context().get("elapsed_time").cloned());
        assert_eq!(elapsed, Some(Value::from(1)));

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_outputs_are_broadcast() {
        let (handle, task) = start(model("stopwatch.yaml"), &manual_config(), None);
        let mut events = handle.subscribe();

        handle.advance(0.2).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "refresh");

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clock_follows_wall_time() {
        let mut config = Config::default();
        config.clock.tick_ms = 5;
        config.clock.speed = 100.0;
        let (handle, task) = start(model("stopwatch.yaml"), &config, None);

        handle.fire("start").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (time, elapsed) = handle.inspect(|it| {
            let elapsed = it
                .context()
                .get("elapsed_time")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            (it.time(), elapsed)
        });
        assert!(time >= 5.0, "simulated time {}", time);
        assert!(elapsed >= 1.0);

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_evaluation_error_is_returned_and_runner_continues() {
        let (handle, task) = start(model("microwave.yaml"), &manual_config(), None);

        let err = handle.fire("program").await.unwrap_err();
        assert_eq!(err.error_code(), "EVALUATION_ERROR");
        handle
            .fire(Event::new("program").with("seconds", 3))
            .await
            .unwrap();

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_final_state_stops_runner() {
        let (handle, task) = start(model("microwave.yaml"), &manual_config(), None);

        handle.fire("unplug").await.unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(
            handle.fire("open").await,
            Err(RuntimeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_without_store() {
        let (handle, task) = start(model("stopwatch.yaml"), &manual_config(), None);
        assert!(matches!(
            handle.checkpoint().await,
            Err(RuntimeError::CheckpointDisabled)
        ));
        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_checkpoint_and_resume() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
        let mut config = manual_config();
        config.checkpoint.enabled = true;
        config.checkpoint.session = "bench".to_string();

        let (handle, task) = start(model("stopwatch.yaml"), &config, Some(Arc::clone(&store)));
        handle.fire("start").await.unwrap();
        handle.advance(1.0).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();
        assert_eq!(store.history("bench").len(), 1);

        let (handle, task) = start(model("stopwatch.yaml"), &config, Some(Arc::clone(&store)));
        let (running, elapsed) = handle.inspect(|it| {
            (it.is_active("running"), it.context().get("elapsed_time").cloned())
        });
        assert!(running);
        assert_eq!(elapsed, Some(Value::from(1)));
        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_periodic_checkpoints_are_pruned() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
        let mut config = manual_config();
        config.checkpoint.enabled = true;
        config.checkpoint.every_steps = 1;
        config.checkpoint.keep = 2;

        let (handle, task) = start(model("stopwatch.yaml"), &config, Some(Arc::clone(&store)));
        for event in ["split", "split", "split", "split"] {
            handle.fire(event).await.unwrap();
        }
        assert_eq!(store.history("default").len(), 2);

        let meta = handle.checkpoint().await.unwrap();
        assert_eq!(store.latest_meta("default"), Some(meta));

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_resume_skips_other_model() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let config = Config::default();

        let microwave = load_interpreter(model("microwave.yaml"), &config, None).unwrap();
        store.save(&config.checkpoint.session, &microwave.checkpoint()).unwrap();

        let it = load_interpreter(model("stopwatch.yaml"), &config, Some(&store)).unwrap();
        assert_eq!(it.model().name(), "Stopwatch");
    }
}
