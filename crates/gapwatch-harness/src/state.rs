//! Per-plane reachability state machines.
//!
//! Three instances exist per run: the forwarding plane (ASIC), the control
//! plane (CPU), and the VLAN ARP path. Each one records the wall-clock
//! instant of the most recent entry into every state, so the orchestrator
//! can read "when did forwarding stop" after the fact.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneState {
    Init,
    Up,
    Partial,
    Down,
}

impl fmt::Display for PlaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlaneState::Init => "init",
            PlaneState::Up => "up",
            PlaneState::Partial => "partial",
            PlaneState::Down => "down",
        };
        f.write_str(label)
    }
}

struct Inner {
    state: PlaneState,
    flooding: bool,
    entered: HashMap<PlaneState, Instant>,
}

/// A small thread-safe FSM; all reads and writes take the same lock.
pub struct StateMachine {
    name: &'static str,
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new(name: &'static str) -> Self {
        let mut entered = HashMap::new();
        entered.insert(PlaneState::Init, Instant::now());
        StateMachine {
            name,
            inner: Mutex::new(Inner {
                state: PlaneState::Init,
                flooding: false,
                entered,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enter `state`, overwriting its entry timestamp. Timestamps of other
    /// states are left untouched.
    pub fn set(&self, state: PlaneState) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = state;
        inner.entered.insert(state, Instant::now());
    }

    pub fn get(&self) -> PlaneState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Most recent entry into `state`, if it was ever entered.
    pub fn state_time(&self, state: PlaneState) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entered
            .get(&state)
            .copied()
    }

    pub fn set_flooding(&self, flooding: bool) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flooding = flooding;
    }

    pub fn is_flooding(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flooding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_in_init_without_flooding() {
        let fsm = StateMachine::new("asic");
        assert_eq!(fsm.get(), PlaneState::Init);
        assert!(!fsm.is_flooding());
        assert!(fsm.state_time(PlaneState::Init).is_some());
        assert!(fsm.state_time(PlaneState::Up).is_none());
    }

    #[test]
    fn set_overwrites_only_the_entered_state_time() {
        let fsm = StateMachine::new("asic");
        fsm.set(PlaneState::Up);
        let up_1 = fsm.state_time(PlaneState::Up).unwrap();

        fsm.set(PlaneState::Down);
        let down = fsm.state_time(PlaneState::Down).unwrap();
        assert!(down >= up_1);
        assert_eq!(fsm.state_time(PlaneState::Up).unwrap(), up_1);

        std::thread::sleep(Duration::from_millis(5));
        fsm.set(PlaneState::Up);
        let up_2 = fsm.state_time(PlaneState::Up).unwrap();
        assert!(up_2 > up_1);
        assert_eq!(fsm.state_time(PlaneState::Down).unwrap(), down);
    }

    #[test]
    fn consecutive_sets_record_monotone_timestamps() {
        let fsm = StateMachine::new("cpu");
        let mut last = Instant::now();
        for state in [
            PlaneState::Up,
            PlaneState::Partial,
            PlaneState::Down,
            PlaneState::Up,
        ] {
            fsm.set(state);
            let entered = fsm.state_time(state).unwrap();
            assert!(entered >= last);
            last = entered;
        }
    }

    #[test]
    fn flooding_flag_is_independent_of_state() {
        let fsm = StateMachine::new("asic");
        fsm.set(PlaneState::Up);
        fsm.set_flooding(true);
        assert!(fsm.is_flooding());
        fsm.set(PlaneState::Down);
        assert!(fsm.is_flooding());
        fsm.set_flooding(false);
        assert!(!fsm.is_flooding());
    }
}
