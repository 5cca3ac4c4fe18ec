//! Network stack collaborator.
//!
//! The engine hands finished downlink packets up and uplink packets back
//! through this trait. Callbacks run on engine tasks (poll context,
//! uplink workers) and must not block.

use crate::types::{RxPacket, TxPacket};

pub trait NetStack: Send + Sync {
    /// A downlink packet is complete.
    fn deliver(&self, pkt: RxPacket);

    /// The device finished with an uplink packet.
    fn tx_complete(&self, _pkt: TxPacket) {}

    /// Virtual queue `vq` refused a packet; stop feeding it.
    fn tx_congested(&self, _vq: usize) {}

    /// Virtual queue `vq` accepts packets again.
    fn tx_resumed(&self, _vq: usize) {}

    /// Carrier changed.
    fn link_changed(&self, _up: bool) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use spin::Mutex;

    /// Records every callback.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingStack {
        pub rx: Mutex<Vec<RxPacket>>,
        pub tx_done: Mutex<Vec<TxPacket>>,
        pub congested: Mutex<Vec<usize>>,
        pub resumed: Mutex<Vec<usize>>,
        pub link: Mutex<Vec<bool>>,
    }

    impl NetStack for RecordingStack {
        fn deliver(&self, pkt: RxPacket) {
            self.rx.lock().push(pkt);
        }

        fn tx_complete(&self, pkt: TxPacket) {
            self.tx_done.lock().push(pkt);
        }

        fn tx_congested(&self, vq: usize) {
            self.congested.lock().push(vq);
        }

        fn tx_resumed(&self, vq: usize) {
            self.resumed.lock().push(vq);
        }

        fn link_changed(&self, up: bool) {
            self.link.lock().push(up);
        }
    }
}
