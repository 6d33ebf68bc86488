//! MAC boundary.
//!
//! The MAC runs as its own event loop and talks to the core through two
//! bounded single-producer/single-consumer channels: requests flow core ->
//! MAC (decoded uplink payloads, SNR reports), responses flow MAC -> core
//! (downlink payload ready, MCS updates). Channel pressure here is
//! non-fatal: a full request channel is counted and dropped-on-the-floor is
//! never an option for payloads, so the core parks them as per-frame stalls
//! that surface as deferrals.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{debug, info};

use core_events::{MAC_SEND_FAILURES, RunFlag};

#[derive(Debug, Clone)]
pub enum MacRequest {
    /// Decoded uplink payload for one user of one symbol.
    PacketToMac {
        frame_id: u32,
        symbol_id: u16,
        ue_id: u32,
        bytes: Vec<u8>,
    },
    SnrReport {
        frame_id: u32,
        ue_id: u32,
        snr_db: f32,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum MacResponse {
    /// The MAC staged downlink payload bytes for this frame; encoding may
    /// be scheduled.
    PacketFromMac { frame_id: u32 },
    RanUpdate { ue_id: u32, mcs_index: u8 },
}

/// Core-side endpoints.
pub struct CoreMac {
    requests: Sender<MacRequest>,
    responses: Receiver<MacResponse>,
}

/// MAC-side endpoints.
pub struct MacSide {
    pub requests: Receiver<MacRequest>,
    pub responses: Sender<MacResponse>,
}

/// Build the two bounded queues connecting core and MAC.
pub fn channel(capacity: usize) -> (CoreMac, MacSide) {
    let (req_tx, req_rx) = bounded(capacity);
    let (resp_tx, resp_rx) = bounded(capacity);
    (
        CoreMac {
            requests: req_tx,
            responses: resp_rx,
        },
        MacSide {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

impl CoreMac {
    /// Non-blocking send; a full or closed channel is counted, not fatal.
    pub fn try_send(&self, req: MacRequest) -> bool {
        match self.requests.try_send(req) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                MAC_SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn try_recv(&self) -> Option<MacResponse> {
        self.responses.try_recv().ok()
    }
}

/// Minimal in-process MAC used by the binary and tests: acknowledges every
/// frame's first uplink delivery with a `PacketFromMac`, so the downlink
/// branch runs end to end without a real MAC attached.
pub struct NullMac;

impl NullMac {
    pub fn spawn(side: MacSide, run: RunFlag) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("null-mac".into())
            .spawn(move || {
                info!(target: "mac", "null_mac_started");
                let mut last_acked: Option<u32> = None;
                while run.is_running() {
                    match side
                        .requests
                        .recv_timeout(std::time::Duration::from_millis(10))
                    {
                        Ok(MacRequest::PacketToMac { frame_id, .. }) => {
                            if last_acked != Some(frame_id) {
                                last_acked = Some(frame_id);
                                let _ = side
                                    .responses
                                    .send(MacResponse::PacketFromMac { frame_id });
                            }
                        }
                        Ok(MacRequest::SnrReport {
                            frame_id,
                            ue_id,
                            snr_db,
                        }) => {
                            debug!(target: "mac", frame_id, ue_id, snr_db, "snr");
                        }
                        Err(_) => {}
                    }
                }
                info!(target: "mac", "null_mac_stopped");
            })
            .expect("spawn null-mac thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_roundtrip() {
        let (core, mac) = channel(4);
        assert!(core.try_send(MacRequest::PacketToMac {
            frame_id: 3,
            symbol_id: 1,
            ue_id: 0,
            bytes: vec![1, 2, 3],
        }));
        match mac.requests.try_recv().unwrap() {
            MacRequest::PacketToMac { frame_id, bytes, .. } => {
                assert_eq!(frame_id, 3);
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
        mac.responses
            .send(MacResponse::PacketFromMac { frame_id: 3 })
            .unwrap();
        assert!(matches!(
            core.try_recv(),
            Some(MacResponse::PacketFromMac { frame_id: 3 })
        ));
        assert!(core.try_recv().is_none());
    }

    #[test]
    fn full_request_channel_is_nonfatal() {
        let (core, _mac) = channel(1);
        let req = || MacRequest::SnrReport {
            frame_id: 0,
            ue_id: 0,
            snr_db: 10.0,
        };
        assert!(core.try_send(req()));
        let before = MAC_SEND_FAILURES.load(Ordering::Relaxed);
        assert!(!core.try_send(req()));
        assert!(MAC_SEND_FAILURES.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn null_mac_acks_each_frame_once() {
        let (core, mac) = channel(16);
        let run = RunFlag::new();
        let handle = NullMac::spawn(mac, run.clone());
        for sym in 0..3u16 {
            core.try_send(MacRequest::PacketToMac {
                frame_id: 7,
                symbol_id: sym,
                ue_id: 0,
                bytes: vec![0],
            });
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut acks = Vec::new();
        while std::time::Instant::now() < deadline {
            if let Some(MacResponse::PacketFromMac { frame_id }) = core.try_recv() {
                acks.push(frame_id);
            }
            if !acks.is_empty() {
                // Allow a beat for spurious duplicates before asserting.
                std::thread::sleep(std::time::Duration::from_millis(20));
                while let Some(MacResponse::PacketFromMac { frame_id }) = core.try_recv() {
                    acks.push(frame_id);
                }
                break;
            }
        }
        run.stop();
        handle.join().unwrap();
        assert_eq!(acks, vec![7]);
    }
}
