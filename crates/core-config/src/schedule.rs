//! Frame schedule: the fixed per-frame symbol sequence.
//!
//! Parsed from the `frame_schedule` string, one character per symbol slot:
//! `P` pilot, `U` uplink data, `D` downlink data, `C` downlink control,
//! `L` calibration uplink, `G` guard. The schedule is fixed at configuration
//! time; every per-symbol counter and batch emitter derives its geometry
//! from it.
//!
//! Calibration (`L`) symbols ride the pilot path: they are received and
//! FFT'd like pilots and gate beam computation the same way. Control (`C`)
//! symbols ride the downlink data path (encode through TX). Guard symbols
//! carry no work.

use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRole {
    Pilot,
    Uplink,
    DownlinkData,
    DownlinkControl,
    CalibrationUl,
    Guard,
}

impl SymbolRole {
    /// Symbols the base station receives over the air.
    pub fn is_rx(self) -> bool {
        matches!(
            self,
            SymbolRole::Pilot | SymbolRole::Uplink | SymbolRole::CalibrationUl
        )
    }

    /// Symbols that gate beam-weight computation.
    pub fn is_pilot_like(self) -> bool {
        matches!(self, SymbolRole::Pilot | SymbolRole::CalibrationUl)
    }

    pub fn is_downlink(self) -> bool {
        matches!(self, SymbolRole::DownlinkData | SymbolRole::DownlinkControl)
    }
}

/// Immutable parsed schedule with precomputed per-role index lists.
#[derive(Debug, Clone)]
pub struct FrameSchedule {
    roles: Vec<SymbolRole>,
    pilots: Vec<u16>,
    uplinks: Vec<u16>,
    downlinks: Vec<u16>,
    /// Position of a symbol within its role list, indexed by symbol id.
    ordinals: Vec<Option<usize>>,
}

impl FrameSchedule {
    pub fn parse(schedule: &str) -> Result<Self, ConfigError> {
        if schedule.is_empty() {
            return Err(ConfigError::Invalid("frame_schedule is empty".into()));
        }
        let mut roles = Vec::with_capacity(schedule.len());
        for (pos, ch) in schedule.chars().enumerate() {
            let role = match ch {
                'P' => SymbolRole::Pilot,
                'U' => SymbolRole::Uplink,
                'D' => SymbolRole::DownlinkData,
                'C' => SymbolRole::DownlinkControl,
                'L' => SymbolRole::CalibrationUl,
                'G' => SymbolRole::Guard,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "frame_schedule[{pos}]: unknown symbol kind {other:?}"
                    )));
                }
            };
            roles.push(role);
        }

        let mut pilots = Vec::new();
        let mut uplinks = Vec::new();
        let mut downlinks = Vec::new();
        let mut ordinals = vec![None; roles.len()];
        for (sym, role) in roles.iter().enumerate() {
            let sym_id = sym as u16;
            match role {
                r if r.is_pilot_like() => {
                    ordinals[sym] = Some(pilots.len());
                    pilots.push(sym_id);
                }
                SymbolRole::Uplink => {
                    ordinals[sym] = Some(uplinks.len());
                    uplinks.push(sym_id);
                }
                r if r.is_downlink() => {
                    ordinals[sym] = Some(downlinks.len());
                    downlinks.push(sym_id);
                }
                _ => {}
            }
        }

        if pilots.is_empty() {
            return Err(ConfigError::Invalid(
                "frame_schedule has no pilot symbol".into(),
            ));
        }

        Ok(Self {
            roles,
            pilots,
            uplinks,
            downlinks,
            ordinals,
        })
    }

    /// Symbols per frame.
    pub fn frame_len(&self) -> usize {
        self.roles.len()
    }

    pub fn role(&self, symbol_id: u16) -> SymbolRole {
        self.roles[symbol_id as usize]
    }

    pub fn pilot_symbols(&self) -> &[u16] {
        &self.pilots
    }

    pub fn uplink_symbols(&self) -> &[u16] {
        &self.uplinks
    }

    pub fn downlink_symbols(&self) -> &[u16] {
        &self.downlinks
    }

    /// Symbols the base station receives (pilot-like plus uplink), in order.
    pub fn rx_symbol_count(&self) -> usize {
        self.pilots.len() + self.uplinks.len()
    }

    /// Position of an uplink symbol within the uplink list.
    pub fn uplink_ordinal(&self, symbol_id: u16) -> Option<usize> {
        if self.role(symbol_id) == SymbolRole::Uplink {
            self.ordinals[symbol_id as usize]
        } else {
            None
        }
    }

    /// Position of a downlink symbol within the downlink list.
    pub fn downlink_ordinal(&self, symbol_id: u16) -> Option<usize> {
        if self.role(symbol_id).is_downlink() {
            self.ordinals[symbol_id as usize]
        } else {
            None
        }
    }

    /// Position of a pilot-like symbol within the pilot list.
    pub fn pilot_ordinal(&self, symbol_id: u16) -> Option<usize> {
        if self.role(symbol_id).is_pilot_like() {
            self.ordinals[symbol_id as usize]
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_schedule() {
        let s = FrameSchedule::parse("PLUUDCG").unwrap();
        assert_eq!(s.frame_len(), 7);
        assert_eq!(s.pilot_symbols(), &[0, 1]);
        assert_eq!(s.uplink_symbols(), &[2, 3]);
        assert_eq!(s.downlink_symbols(), &[4, 5]);
        assert_eq!(s.role(6), SymbolRole::Guard);
        assert_eq!(s.rx_symbol_count(), 4);
    }

    #[test]
    fn ordinals_are_role_local() {
        let s = FrameSchedule::parse("PUDUD").unwrap();
        assert_eq!(s.uplink_ordinal(1), Some(0));
        assert_eq!(s.uplink_ordinal(3), Some(1));
        assert_eq!(s.downlink_ordinal(2), Some(0));
        assert_eq!(s.downlink_ordinal(4), Some(1));
        assert_eq!(s.uplink_ordinal(2), None);
        assert_eq!(s.pilot_ordinal(0), Some(0));
    }

    #[test]
    fn rejects_unknown_symbol_kind() {
        let err = FrameSchedule::parse("PX").unwrap_err();
        assert!(err.to_string().contains("unknown symbol kind"));
    }

    #[test]
    fn rejects_pilotless_schedule() {
        assert!(FrameSchedule::parse("UUDD").is_err());
        assert!(FrameSchedule::parse("").is_err());
    }
}
