use crate::_typed_codec::{Codec, Json};
use crate::{Action, Event, RetryPolicy};
use serde::{de::DeserializeOwned, Serialize};

/// Replay cursor over one instance's history.
///
/// Workflow code calls `activity`/`timer` in a fixed order; each call claims
/// the next scheduling event (`ActivityScheduled`/`TimerCreated`) in history
/// order and resolves it against completions by correlation id. A call whose
/// completion has not arrived yet suspends the workflow by returning the
/// action to dispatch as `Err`, which `?` propagates out of `Workflow::run`.
///
/// Repeated replays over the same history prefix therefore claim the same
/// events, allocate the same correlation ids, and produce the same action.
pub struct Steps<'a> {
    history: &'a [Event],
    /// Positions of scheduling events not yet claimed this replay, in order.
    schedule_positions: Vec<usize>,
    claim_cursor: usize,
    next_id: u64,
    input: &'a str,
    started_at_ms: u64,
    now_ms: u64,
}

impl<'a> Steps<'a> {
    pub fn new(history: &'a [Event]) -> Self {
        let mut schedule_positions = Vec::new();
        let mut next_id = 1u64;
        let mut input: &'a str = "";
        let mut started_at_ms = 0u64;
        for (pos, ev) in history.iter().enumerate() {
            match ev {
                Event::InstanceStarted {
                    input: inp,
                    started_at_ms: at,
                    ..
                } => {
                    input = inp;
                    started_at_ms = *at;
                }
                Event::ActivityScheduled { .. } | Event::TimerCreated { .. } => {
                    schedule_positions.push(pos);
                }
                _ => {}
            }
            if let Some(id) = ev.correlation_id() {
                next_id = next_id.max(id + 1);
            }
        }
        Self {
            history,
            schedule_positions,
            claim_cursor: 0,
            next_id,
            input,
            started_at_ms,
            now_ms: started_at_ms,
        }
    }

    /// Raw workflow input as recorded in `InstanceStarted`.
    pub fn input(&self) -> &str {
        self.input
    }

    /// Decoded workflow input; a decode failure is a terminal `Fail`.
    pub fn input_typed<T: DeserializeOwned>(&self) -> Result<T, Action> {
        Json::decode(self.input).map_err(|e| Action::Fail {
            error: format!("invalid workflow input: {e}"),
        })
    }

    /// Wall-clock time at which the instance was started, in ms since epoch.
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Logical current time: the start time advanced by every timer consumed
    /// so far. Never reads the real clock.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Schedule (or replay) an activity with a single attempt.
    pub fn activity(&mut self, name: &str, input: impl Into<String>) -> Result<String, Action> {
        self.activity_with_retry(name, input, RetryPolicy::none())
    }

    /// Schedule (or replay) an activity honoring a retry policy.
    ///
    /// Returns `Ok(result)` when the activity has completed in history,
    /// `Err(Fail)` when it failed after retries, and `Err(ScheduleActivity)`
    /// when it is not yet scheduled or still in flight.
    pub fn activity_with_retry(
        &mut self,
        name: &str,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<String, Action> {
        match self.claim_next() {
            None => {
                let id = self.allocate_id();
                Err(Action::ScheduleActivity {
                    id,
                    name: name.to_string(),
                    input: input.into(),
                    retry,
                })
            }
            Some(Event::ActivityScheduled {
                id,
                name: recorded_name,
                input: recorded_input,
                retry: recorded_retry,
                ..
            }) => {
                if recorded_name != name {
                    return Err(nondeterminism(&format!(
                        "history scheduled activity '{recorded_name}' (id {id}) but code requested '{name}'"
                    )));
                }
                match self.find_completion(*id) {
                    Some(Event::ActivityCompleted { result, .. }) => Ok(result.clone()),
                    Some(Event::ActivityFailed { error, .. }) => Err(Action::Fail {
                        error: format!("activity '{name}' failed: {error}"),
                    }),
                    _ => Err(Action::ScheduleActivity {
                        id: *id,
                        name: recorded_name.clone(),
                        input: recorded_input.clone(),
                        retry: recorded_retry.clone(),
                    }),
                }
            }
            Some(Event::TimerCreated { id, .. }) => Err(nondeterminism(&format!(
                "history created timer (id {id}) but code requested activity '{name}'"
            ))),
            Some(_) => unreachable!("claim_next yields only scheduling events"),
        }
    }

    /// Typed activity wrapper; payloads go through the JSON codec.
    pub fn activity_typed<In, Out>(&mut self, name: &str, input: &In) -> Result<Out, Action>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let payload = Json::encode(input).map_err(|e| Action::Fail {
            error: format!("encode input for '{name}': {e}"),
        })?;
        let raw = self.activity(name, payload)?;
        Json::decode(&raw).map_err(|e| Action::Fail {
            error: format!("decode result of '{name}': {e}"),
        })
    }

    /// Schedule (or replay) a durable timer firing at an absolute time.
    /// Consuming a fired timer advances the logical clock to `fire_at_ms`.
    pub fn timer(&mut self, fire_at_ms: u64) -> Result<(), Action> {
        match self.claim_next() {
            None => {
                let id = self.allocate_id();
                Err(Action::ScheduleTimer { id, fire_at_ms })
            }
            Some(Event::TimerCreated {
                id,
                fire_at_ms: recorded_at,
                ..
            }) => match self.find_completion(*id) {
                Some(Event::TimerFired { fire_at_ms: fired_at, .. }) => {
                    self.now_ms = self.now_ms.max(*fired_at);
                    Ok(())
                }
                _ => Err(Action::ScheduleTimer {
                    id: *id,
                    fire_at_ms: *recorded_at,
                }),
            },
            Some(Event::ActivityScheduled { id, name, .. }) => Err(nondeterminism(&format!(
                "history scheduled activity '{name}' (id {id}) but code requested a timer"
            ))),
            Some(_) => unreachable!("claim_next yields only scheduling events"),
        }
    }

    fn claim_next(&mut self) -> Option<&'a Event> {
        let pos = self.schedule_positions.get(self.claim_cursor).copied()?;
        self.claim_cursor += 1;
        Some(&self.history[pos])
    }

    fn find_completion(&self, id: u64) -> Option<&'a Event> {
        self.history.iter().find(|ev| match ev {
            Event::ActivityCompleted { id: cid, .. }
            | Event::ActivityFailed { id: cid, .. }
            | Event::TimerFired { id: cid, .. } => *cid == id,
            _ => false,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn nondeterminism(detail: &str) -> Action {
    Action::Fail {
        error: format!("nondeterministic replay: {detail}"),
    }
}
