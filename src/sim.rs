//! In-memory transport pair for unit testing diagnostic endpoints
//!
//! [SimTransport] satisfies the [UdsTransport] contract without a network:
//! two endpoints share a pair of FIFO queues of complete SDUs. Delivery is
//! immediate, so tests drive timing purely through the endpoint clocks.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::channel::{
    ChannelError, ChannelResult, SduInfo, TargetAddressType, TpStatus, UDS_TP_MTU, UdsTransport,
};

type SduQueue = Arc<Mutex<VecDeque<(Vec<u8>, SduInfo)>>>;

/// One endpoint of a simulated transport pair
pub struct SimTransport {
    name: &'static str,
    send_buf: Vec<u8>,
    rx: SduQueue,
    tx: SduQueue,
    peeked: Option<(Vec<u8>, SduInfo)>,
    phys_addr: u16,
    peer_phys_addr: u16,
    func_addr: u16,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("name", &self.name)
            .field("phys_addr", &self.phys_addr)
            .finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Creates a connected (client, server) transport pair using the example
    /// addressing profile: the server receives physically at 0x701 and
    /// functionally at 0x702, and replies at 0x700.
    pub fn pair() -> (SimTransport, SimTransport) {
        let a_to_b: SduQueue = Arc::default();
        let b_to_a: SduQueue = Arc::default();
        let client = SimTransport {
            name: "client",
            send_buf: vec![0; UDS_TP_MTU],
            rx: b_to_a.clone(),
            tx: a_to_b.clone(),
            peeked: None,
            phys_addr: 0x700,
            peer_phys_addr: 0x701,
            func_addr: 0x702,
        };
        let server = SimTransport {
            name: "server",
            send_buf: vec![0; UDS_TP_MTU],
            rx: a_to_b,
            tx: b_to_a,
            peeked: None,
            phys_addr: 0x701,
            peer_phys_addr: 0x700,
            func_addr: 0x702,
        };
        (client, server)
    }

    /// Number of SDUs waiting to be received by this endpoint (excluding a
    /// currently peeked one)
    pub fn pending(&self) -> usize {
        self.rx.lock().unwrap().len()
    }
}

impl UdsTransport for SimTransport {
    fn get_send_buf(&mut self) -> ChannelResult<&mut [u8]> {
        Ok(&mut self.send_buf)
    }

    fn send(&mut self, len: usize, info: &SduInfo) -> ChannelResult<usize> {
        if len > self.send_buf.len() {
            return Err(ChannelError::PayloadTooLarge(len));
        }
        if info.ta_type == TargetAddressType::Functional && len > 7 {
            return Err(ChannelError::FunctionalPayloadTooLarge);
        }
        let target = match info.ta_type {
            TargetAddressType::Physical => self.peer_phys_addr,
            TargetAddressType::Functional => self.func_addr,
        };
        let delivered = SduInfo {
            mtype: info.mtype,
            source_addr: self.phys_addr,
            target_addr: target,
            ta_type: info.ta_type,
            remote_addr: info.remote_addr,
        };
        debug!("{}: tx {:02X?}", self.name, &self.send_buf[..len]);
        self.tx
            .lock()
            .unwrap()
            .push_back((self.send_buf[..len].to_vec(), delivered));
        Ok(len)
    }

    fn poll(&mut self) -> TpStatus {
        // sends complete synchronously
        if self.peeked.is_some() || !self.rx.lock().unwrap().is_empty() {
            TpStatus::RECV_COMPLETE
        } else {
            TpStatus::empty()
        }
    }

    fn peek(&mut self) -> ChannelResult<Option<(&[u8], SduInfo)>> {
        if self.peeked.is_none() {
            self.peeked = self.rx.lock().unwrap().pop_front();
            if let Some((payload, _)) = &self.peeked {
                debug!("{}: rx {:02X?}", self.name, payload);
            }
        }
        Ok(self
            .peeked
            .as_ref()
            .map(|(payload, info)| (payload.as_slice(), *info)))
    }

    fn ack_recv(&mut self) {
        self.peeked = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_is_stable_until_ack() {
        let (mut client, mut server) = SimTransport::pair();
        let buf = client.get_send_buf().unwrap();
        buf[..2].copy_from_slice(&[0x3E, 0x00]);
        client.send(2, &SduInfo::default()).unwrap();
        buf_send(&mut client, &[0x10, 0x03]);

        assert!(server.poll().contains(TpStatus::RECV_COMPLETE));
        let (first, info) = server.peek().unwrap().unwrap();
        assert_eq!(first, &[0x3E, 0x00]);
        assert_eq!(info.ta_type, TargetAddressType::Physical);
        // still the same message before ack
        let (again, _) = server.peek().unwrap().unwrap();
        assert_eq!(again, &[0x3E, 0x00]);
        server.ack_recv();
        let (second, _) = server.peek().unwrap().unwrap();
        assert_eq!(second, &[0x10, 0x03]);
    }

    #[test]
    fn functional_send_is_single_frame_only() {
        let (mut client, _server) = SimTransport::pair();
        let info = SduInfo {
            ta_type: TargetAddressType::Functional,
            ..Default::default()
        };
        assert!(matches!(
            client.send(8, &info),
            Err(ChannelError::FunctionalPayloadTooLarge)
        ));
        assert!(client.send(7, &info).is_ok());
    }

    fn buf_send(tp: &mut SimTransport, data: &[u8]) {
        let buf = tp.get_send_buf().unwrap();
        buf[..data.len()].copy_from_slice(data);
        tp.send(data.len(), &SduInfo::default()).unwrap();
    }
}
