//! DropTail：按字节计容量，装不下就丢新来的

use std::collections::VecDeque;

use crate::net::Packet;

use super::PacketQueue;

#[derive(Debug)]
pub struct DropTailQueue {
    cap_bytes: u64,
    bytes: u64,
    peak_bytes: u64,
    q: VecDeque<Packet>,
}

impl DropTailQueue {
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            cap_bytes,
            bytes: 0,
            peak_bytes: 0,
            q: VecDeque::new(),
        }
    }
}

impl PacketQueue for DropTailQueue {
    fn enqueue(&mut self, pkt: Packet) -> Result<(), Packet> {
        let bytes = self.bytes.saturating_add(pkt.size_bytes as u64);
        if bytes > self.cap_bytes {
            return Err(pkt);
        }
        self.bytes = bytes;
        self.peak_bytes = self.peak_bytes.max(bytes);
        self.q.push_back(pkt);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Packet> {
        let pkt = self.q.pop_front()?;
        self.bytes = self.bytes.saturating_sub(pkt.size_bytes as u64);
        Some(pkt)
    }

    fn len(&self) -> usize {
        self.q.len()
    }

    fn bytes(&self) -> u64 {
        self.bytes
    }

    fn capacity_bytes(&self) -> u64 {
        self.cap_bytes
    }

    fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }
}
