/// Low-power gating decision.
///
/// While a handshake-initiated connect sequence is outstanding, low power is
/// refused and remembered; finishing the sequence reports whether a deferred
/// entry is owed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LowPowerGate {
    wait_handshake: bool,
    scheduled: bool,
}

impl LowPowerGate {
    /// A connect sequence started: close the gate, drop any deferred entry.
    pub fn begin_sequence(&mut self) {
        self.scheduled = false;
        self.wait_handshake = true;
    }

    pub fn is_low_power_ok(&mut self) -> bool {
        if self.wait_handshake {
            self.scheduled = true;
            false
        } else {
            true
        }
    }

    /// The sequence finished. Returns true when low power was refused in
    /// the meantime and must be entered now.
    pub fn finish_sequence(&mut self) -> bool {
        self.wait_handshake = false;
        std::mem::take(&mut self.scheduled)
    }

    pub fn waiting(&self) -> bool {
        self.wait_handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_gate_allows_low_power() {
        let mut gate = LowPowerGate::default();
        assert!(gate.is_low_power_ok());
        assert!(!gate.finish_sequence());
    }

    #[test]
    fn refused_request_is_entered_once_sequence_finishes() {
        let mut gate = LowPowerGate::default();
        gate.begin_sequence();
        assert!(!gate.is_low_power_ok());
        assert!(gate.waiting());
        assert!(gate.finish_sequence());
        assert!(!gate.finish_sequence());
        assert!(gate.is_low_power_ok());
    }

    #[test]
    fn new_sequence_discards_pending_entry() {
        let mut gate = LowPowerGate::default();
        gate.begin_sequence();
        assert!(!gate.is_low_power_ok());
        gate.begin_sequence();
        assert!(!gate.finish_sequence());
    }
}
