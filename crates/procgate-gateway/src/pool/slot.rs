//! Pool slot state

use std::fmt;
use std::time::{Duration, Instant};

/// Lock state of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// No session; free to lease
    Unused,
    /// Leased, session not yet established
    New,
    /// Holds an idle session; free to lease
    Available,
    /// Leased with an established session
    InUse,
    /// Administratively removed; never leased
    Offline,
    /// Unrecognized state read back from the shared registry
    Unknown,
}

impl SlotState {
    pub const ALL: [SlotState; 6] = [
        SlotState::Unused,
        SlotState::New,
        SlotState::Available,
        SlotState::InUse,
        SlotState::Offline,
        SlotState::Unknown,
    ];

    /// Position in count arrays and the registry record layout
    pub fn index(self) -> usize {
        match self {
            SlotState::Unused => 0,
            SlotState::New => 1,
            SlotState::Available => 2,
            SlotState::InUse => 3,
            SlotState::Offline => 4,
            SlotState::Unknown => 5,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or(SlotState::Unknown)
    }

    /// Can be handed out by acquire
    pub fn is_reusable(self) -> bool {
        matches!(self, SlotState::Unused | SlotState::Available)
    }

    /// Currently owned by a lease
    pub fn is_held(self) -> bool {
        matches!(self, SlotState::New | SlotState::InUse)
    }

    pub fn label(self) -> &'static str {
        match self {
            SlotState::Unused => "unused",
            SlotState::New => "new",
            SlotState::Available => "available",
            SlotState::InUse => "in_use",
            SlotState::Offline => "offline",
            SlotState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Typed index into a location's slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slot counts indexed by [`SlotState::index`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts(pub [u32; 6]);

impl SlotCounts {
    pub fn get(&self, state: SlotState) -> u32 {
        self.0[state.index()]
    }

    pub fn add(&mut self, state: SlotState, n: u32) {
        self.0[state.index()] = self.0[state.index()].saturating_add(n);
    }

    pub fn held(&self) -> u32 {
        self.get(SlotState::New) + self.get(SlotState::InUse)
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|c| *c == 0)
    }

    pub fn merge(&mut self, other: &SlotCounts) {
        for state in SlotState::ALL {
            self.add(state, other.get(state));
        }
    }
}

/// One reusable backend-session holder
#[derive(Debug)]
pub struct PoolSlot<S> {
    pub state: SlotState,
    pub last_active: Instant,
    /// Session affinity key the session currently belongs to
    pub affinity: Option<String>,
    pub session: Option<S>,
}

impl<S> PoolSlot<S> {
    pub fn new() -> Self {
        Self {
            state: SlotState::Unused,
            last_active: Instant::now(),
            affinity: None,
            session: None,
        }
    }

    pub fn idle_beyond(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > max_idle
    }
}

impl<S> Default for PoolSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Count slot states
pub fn count_states<S>(slots: &[PoolSlot<S>]) -> SlotCounts {
    let mut counts = SlotCounts::default();
    for slot in slots {
        counts.add(slot.state, 1);
    }
    counts
}
