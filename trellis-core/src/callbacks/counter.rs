use crate::callback::Callback;
use crate::error::Result;
use crate::state::State;
use crate::value::Value;

/// Maintains `epoch`, `iters` and `epoch_batch`.
///
/// While a batch's hooks run, `iters` is that batch's 0-based global index
/// and `epoch_batch` its index within the epoch. `epoch` is 0 during the
/// first epoch. Counters already present in the state are continued from.
#[derive(Debug, Default)]
pub struct Counter {
    seen_epoch: bool,
    started: bool,
    epoch_batches: i64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Callback for Counter {
    fn name(&self) -> &str {
        "Counter"
    }

    fn on_epoch_start(&mut self, state: &mut State) -> Result<()> {
        let epoch = match state.get("epoch").and_then(Value::as_int) {
            Some(e) if self.seen_epoch => e + 1,
            Some(e) => e,
            None => 0,
        };
        state.insert("epoch", epoch)?;
        state.insert("epoch_batch", 0i64)?;
        if !state.contains("iters") {
            state.insert("iters", 0i64)?;
        }
        self.seen_epoch = true;
        self.epoch_batches = 0;
        Ok(())
    }

    fn on_batch_start(&mut self, state: &mut State) -> Result<()> {
        if self.started {
            let iters = state.get("iters").and_then(Value::as_int).unwrap_or(-1);
            state.insert("iters", iters + 1)?;
        }
        state.insert("epoch_batch", self.epoch_batches)?;
        self.started = true;
        self.epoch_batches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Hook;

    fn drive(counter: &mut Counter, state: &mut State, epochs: usize, batches: usize) -> Vec<(i64, i64, i64)> {
        let mut seen = Vec::new();
        for _ in 0..epochs {
            counter.call(Hook::OnEpochStart, state).unwrap();
            for _ in 0..batches {
                counter.call(Hook::OnBatchStart, state).unwrap();
                seen.push((
                    state.int("epoch").unwrap(),
                    state.int("iters").unwrap(),
                    state.int("epoch_batch").unwrap(),
                ));
                counter.call(Hook::OnBatchEnd, state).unwrap();
            }
            counter.call(Hook::OnEpochEnd, state).unwrap();
        }
        seen
    }

    #[test]
    fn test_counts_from_zero() {
        let mut state = State::new();
        let seen = drive(&mut Counter::new(), &mut state, 2, 3);
        assert_eq!(
            seen,
            vec![
                (0, 0, 0),
                (0, 1, 1),
                (0, 2, 2),
                (1, 3, 0),
                (1, 4, 1),
                (1, 5, 2)
            ]
        );
    }

    #[test]
    fn test_continues_existing_counters() {
        let mut state = State::new();
        state.insert("epoch", 3).unwrap();
        state.insert("iters", 40).unwrap();
        let seen = drive(&mut Counter::new(), &mut state, 1, 2);
        assert_eq!(seen, vec![(3, 40, 0), (3, 41, 1)]);
    }

    #[test]
    fn test_empty_epoch_does_not_advance_iters() {
        let mut state = State::new();
        let mut counter = Counter::new();
        drive(&mut counter, &mut state, 1, 0);
        let seen = drive(&mut counter, &mut state, 1, 1);
        assert_eq!(seen, vec![(1, 0, 0)]);
    }
}
