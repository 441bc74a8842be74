//! Relay outputs via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock board keeps state in memory and logs changes.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// One relay output on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Zone(u8),
    SafetyRelay,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zone(id) => write!(f, "zone {id}"),
            Self::SafetyRelay => write!(f, "safety relay"),
        }
    }
}

/// Logical relay control. `open = true` means water may flow (zone valve
/// open, safety relay engaged); polarity is the board's concern.
pub trait RelayBoard: Send {
    fn drive(&mut self, channel: Channel, open: bool) -> Result<()>;

    /// Whether the board has an output wired for `channel`.
    fn has(&self, channel: Channel) -> bool;
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioBoard {
    pins: HashMap<Channel, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioBoard {
    pub fn new(zone_pins: &[(u8, u8)], relay_pin: Option<u8>, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        let channels = zone_pins
            .iter()
            .map(|(id, pin)| (Channel::Zone(*id), *pin))
            .chain(relay_pin.map(|p| (Channel::SafetyRelay, p)));

        for (channel, pin_num) in channels {
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: ensure "closed" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            tracing::info!(%channel, gpio = pin_num, "relay output initialised");
            pins.insert(channel, pin);
        }

        Ok(Self { pins, active_low })
    }
}

#[cfg(feature = "gpio")]
impl RelayBoard for GpioBoard {
    fn drive(&mut self, channel: Channel, open: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("{channel} has no initialised output"))?;

        // active-low: LOW = open, HIGH = closed
        if open != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn has(&self, channel: Channel) -> bool {
        self.pins.contains_key(&channel)
    }
}

// ---------------------------------------------------------------------------
// Mock relay board for development and tests
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    outputs: HashMap<Channel, bool>,
    failing: HashSet<Channel>,
    writes: Vec<(Channel, bool)>,
}

/// In-memory board. Clones share state, so a test can keep a handle after
/// moving the board into the actuator, and inject write failures.
#[derive(Clone, Default)]
pub struct MockBoard {
    state: Arc<Mutex<MockState>>,
}

impl MockBoard {
    pub fn new(zone_pins: &[(u8, u8)], relay_pin: Option<u8>) -> Self {
        let board = Self::default();
        {
            let mut st = board.lock();
            for (zone_id, pin_num) in zone_pins {
                tracing::debug!(zone = zone_id, gpio = pin_num, "[mock-gpio] registered (not wired)");
                st.outputs.insert(Channel::Zone(*zone_id), false);
            }
            if relay_pin.is_some() {
                st.outputs.insert(Channel::SafetyRelay, false);
            }
        }
        tracing::info!("[mock-gpio] relay board initialised (no hardware)");
        board
    }

    /// Logical state of an output; `None` when the channel is not wired.
    pub fn is_open(&self, channel: Channel) -> Option<bool> {
        self.lock().outputs.get(&channel).copied()
    }

    /// Make every subsequent write to `channel` fail (or succeed again).
    pub fn set_failing(&self, channel: Channel, failing: bool) {
        let mut st = self.lock();
        if failing {
            st.failing.insert(channel);
        } else {
            st.failing.remove(&channel);
        }
    }

    /// Successful writes, in order.
    pub fn writes(&self) -> Vec<(Channel, bool)> {
        self.lock().writes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RelayBoard for MockBoard {
    fn drive(&mut self, channel: Channel, open: bool) -> Result<()> {
        let mut st = self.lock();
        if st.failing.contains(&channel) {
            return Err(anyhow!("[mock-gpio] write to {channel} failed"));
        }
        match st.outputs.get_mut(&channel) {
            Some(state) => {
                *state = open;
                st.writes.push((channel, open));
                tracing::debug!(%channel, open, "[mock-gpio] output set");
                Ok(())
            }
            None => Err(anyhow!("{channel} has no initialised output")),
        }
    }

    fn has(&self, channel: Channel) -> bool {
        self.lock().outputs.contains_key(&channel)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
