use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::state::EphemeralState;
use crate::repository::CounterRepository;
use crate::storage::{Counter, HistoryAction, NewCounter};

/// A write requested by the presentation layer.
#[derive(Debug, Clone)]
pub enum CounterAction {
    Insert(NewCounter),
    Update(Counter),
    Delete(Counter),
    ToggleFavorite(Counter),
    Archive(Counter),
    Unarchive(Counter),
    SetProgress { counter: Counter, progress: i64 },
    Increment(Counter),
    Decrement(Counter),
    AddNote { counter: Counter, note: String },
    RemoveNote { counter: Counter, index: usize },
    SetIcon { counter: Counter, icon: String },
    SetBackgroundColor { counter: Counter, argb: Option<u32> },
}

impl CounterAction {
    fn label(&self) -> &'static str {
        match self {
            CounterAction::Insert(_) => "insert",
            CounterAction::Update(_) => "update",
            CounterAction::Delete(_) => "delete",
            CounterAction::ToggleFavorite(_) => "toggle favorite",
            CounterAction::Archive(_) => "archive",
            CounterAction::Unarchive(_) => "unarchive",
            CounterAction::SetProgress { .. } => "set progress",
            CounterAction::Increment(_) => "increment",
            CounterAction::Decrement(_) => "decrement",
            CounterAction::AddNote { .. } => "add note",
            CounterAction::RemoveNote { .. } => "remove note",
            CounterAction::SetIcon { .. } => "set icon",
            CounterAction::SetBackgroundColor { .. } => "set color",
        }
    }

    fn apply(self, repository: &CounterRepository) -> Result<()> {
        match self {
            CounterAction::Insert(counter) => {
                repository.insert_counter(&counter)?;
            }
            CounterAction::Update(counter) => {
                repository.update_counter(&counter)?;
            }
            CounterAction::Delete(counter) => {
                repository.delete_counter(&counter)?;
            }
            CounterAction::ToggleFavorite(counter) => {
                repository.toggle_favorite(&counter)?;
            }
            CounterAction::Archive(counter) => {
                repository.archive_counter(&counter)?;
            }
            CounterAction::Unarchive(counter) => {
                repository.unarchive_counter(&counter)?;
            }
            CounterAction::SetProgress { counter, progress } => {
                if repository.update_progress(&counter, progress)? {
                    repository.add_history_entry(
                        &counter,
                        HistoryAction::Progress.as_ref(),
                        progress,
                    )?;
                }
            }
            CounterAction::Increment(counter) => {
                step_progress(repository, &counter, HistoryAction::Increment)?;
            }
            CounterAction::Decrement(counter) => {
                step_progress(repository, &counter, HistoryAction::Decrement)?;
            }
            CounterAction::AddNote { counter, note } => {
                repository.add_note(&counter, &note)?;
            }
            CounterAction::RemoveNote { counter, index } => {
                repository.remove_note(&counter, index)?;
            }
            CounterAction::SetIcon { counter, icon } => {
                repository.set_icon(&counter, &icon)?;
            }
            CounterAction::SetBackgroundColor { counter, argb } => {
                repository.set_background_color(&counter, argb)?;
            }
        }
        Ok(())
    }
}

/// Moves progress one step from its stored value. Decrement stops at zero.
fn step_progress(
    repository: &CounterRepository,
    counter: &Counter,
    action: HistoryAction,
) -> Result<()> {
    let Some(fresh) = repository.get_counter(counter.id)? else {
        tracing::debug!(counter_id = counter.id, "counter vanished before {action}");
        return Ok(());
    };
    let next = match action {
        HistoryAction::Decrement if fresh.current_progress <= 0 => return Ok(()),
        HistoryAction::Decrement => fresh.current_progress - 1,
        _ => fresh.current_progress.saturating_add(1),
    };
    if repository.update_progress(&fresh, next)? {
        repository.add_history_entry(&fresh, action.as_ref(), next)?;
    }
    Ok(())
}

enum Command {
    Apply(CounterAction),
    Flush(Sender<()>),
    Shutdown,
}

/// Applies queued actions in order on a dedicated thread.
pub struct ActionWorker {
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ActionWorker {
    pub fn spawn(repository: CounterRepository, state: Arc<EphemeralState>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("countdown-writer".into())
            .spawn(move || run(repository, state, receiver))
            .context("spawning counter write worker")?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub fn dispatch(&self, action: CounterAction) {
        let label = action.label();
        if self.sender.send(Command::Apply(action)).is_err() {
            tracing::error!(action = label, "write worker is gone, dropping action");
        }
    }

    /// Blocks until every action dispatched before this call has been applied.
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(Command::Flush(done_tx))
            .map_err(|_| anyhow!("write worker is gone"))?;
        done_rx
            .recv()
            .map_err(|_| anyhow!("write worker stopped before flushing"))
    }
}

impl Drop for ActionWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.sender.send(Command::Shutdown) {
                tracing::error!(%err, "failed to stop write worker");
            }
            if handle.join().is_err() {
                tracing::error!("write worker panicked");
            }
        }
    }
}

fn run(repository: CounterRepository, state: Arc<EphemeralState>, receiver: Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Apply(action) => {
                let label = action.label();
                if let Err(err) = action.apply(&repository) {
                    let detail = format!("{err:#}");
                    tracing::error!(action = label, error = %detail, "counter write failed");
                    state.last_error.set(Some(format!("{label} failed: {err}")));
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("write worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::storage::StorageHandle;
    use tempfile::TempDir;

    type Fixture = (TempDir, CounterRepository, Arc<EphemeralState>, ActionWorker);

    fn worker() -> anyhow::Result<Fixture> {
        let temp = TempDir::new()?;
        let db_path = temp.path().join("counters.db");
        let storage = StorageHandle::new(db_path, StorageOptions::default());
        let repository = CounterRepository::new(storage);
        let state = Arc::new(EphemeralState::default());
        let worker = ActionWorker::spawn(repository.clone(), Arc::clone(&state))?;
        Ok((temp, repository, state, worker))
    }

    #[test]
    fn increments_record_history() -> anyhow::Result<()> {
        let (_temp, repository, _state, worker) = worker()?;
        let id = repository.insert_counter(&NewCounter::new("Pages", 10))?;
        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;

        worker.dispatch(CounterAction::Increment(counter.clone()));
        worker.dispatch(CounterAction::Increment(counter.clone()));
        worker.dispatch(CounterAction::Decrement(counter));
        worker.flush()?;

        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(counter.current_progress, 1);
        let actions: Vec<_> = counter.history.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["increment", "increment", "decrement"]);
        Ok(())
    }

    #[test]
    fn decrement_at_zero_is_ignored() -> anyhow::Result<()> {
        let (_temp, repository, _state, worker) = worker()?;
        let id = repository.insert_counter(&NewCounter::new("Laps", 10))?;
        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;
        worker.dispatch(CounterAction::Decrement(counter));
        worker.flush()?;
        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(counter.current_progress, 0);
        assert!(counter.history.is_empty());
        Ok(())
    }

    #[test]
    fn set_progress_logs_progress_entry() -> anyhow::Result<()> {
        let (_temp, repository, _state, worker) = worker()?;
        let id = repository.insert_counter(&NewCounter::new("Savings", 10))?;
        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;
        worker.dispatch(CounterAction::SetProgress {
            counter,
            progress: 40,
        });
        worker.flush()?;
        let counter = repository.get_counter(id)?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(counter.current_progress, 40);
        assert_eq!(counter.history.len(), 1);
        assert_eq!(counter.history[0].action, "progress");
        assert_eq!(counter.history[0].value, 40);
        Ok(())
    }

    #[test]
    fn failures_surface_as_last_error() -> anyhow::Result<()> {
        let (_temp, _repository, state, worker) = worker()?;
        worker.dispatch(CounterAction::Insert(NewCounter::new("   ", 10)));
        worker.flush()?;
        let message = state.last_error.get().ok_or_else(|| anyhow!("no error recorded"))?;
        assert!(message.starts_with("insert failed"), "{message}");
        Ok(())
    }

    #[test]
    fn drop_applies_queued_actions_before_joining() -> anyhow::Result<()> {
        let (_temp, repository, _state, worker) = worker()?;
        for day in 0..3 {
            worker.dispatch(CounterAction::Insert(NewCounter::new(format!("day {day}"), day)));
        }
        drop(worker);
        assert_eq!(repository.all_counters().current()?.len(), 3);
        Ok(())
    }
}
