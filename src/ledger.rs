//! Day-level attendance lock state machine.
//!
//! Each `(date, class, section)` tuple is in exactly one of three states:
//! Open (nobody has marked yet), Locked (a first marker holds the day), or
//! Frozen (admin override). Transitions: Open -> Locked on first successful
//! mark; any -> Frozen and Frozen -> Open/Locked by admin action only.
//! Privileged writers pass the gate in every state.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    Open,
    Locked,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDenied {
    /// Admin froze the day; remedy is an admin unfreeze.
    Frozen,
    /// First-marker-wins: someone already recorded this day; remedy is an
    /// admin correction.
    AlreadyMarked,
}

/// Derive the state from the day-lock row, if any. Frozen dominates Locked:
/// an admin freeze stays in force even while the day is also marked.
pub fn day_state(lock_row: Option<(bool, bool)>) -> DayState {
    match lock_row {
        Some((_, true)) => DayState::Frozen,
        Some((true, false)) => DayState::Locked,
        // A leftover row from freeze+unfreeze with no marks behaves as Open.
        Some((false, false)) => DayState::Open,
        None => DayState::Open,
    }
}

pub fn gate_write(state: DayState, privileged: bool) -> Result<(), WriteDenied> {
    if privileged {
        return Ok(());
    }
    match state {
        DayState::Open => Ok(()),
        DayState::Locked => Err(WriteDenied::AlreadyMarked),
        DayState::Frozen => Err(WriteDenied::Frozen),
    }
}
