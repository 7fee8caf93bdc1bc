use crate::net::{NodeId, Packet, Transport};
use crate::queue::{DEFAULT_PKT_BYTES, DropTailQueue, PacketQueue, mem_from_pkt};

fn pkt(id: u64, size_bytes: u32) -> Packet {
    Packet {
        id,
        flow_id: 0,
        size_bytes,
        route: vec![NodeId(0), NodeId(1)],
        hop: 0,
        transport: Transport::None,
    }
}

#[test]
fn droptail_queue_enforces_capacity_and_preserves_order() {
    let mut q = DropTailQueue::new(100);
    assert_eq!(q.capacity_bytes(), 100);
    assert_eq!(q.len(), 0);
    assert_eq!(q.bytes(), 0);

    assert!(q.enqueue(pkt(1, 60)).is_ok());
    assert_eq!(q.len(), 1);
    assert_eq!(q.bytes(), 60);

    let dropped = q.enqueue(pkt(2, 50)).expect_err("should drop");
    assert_eq!(dropped.id, 2);
    assert_eq!(q.len(), 1);
    assert_eq!(q.bytes(), 60);

    assert!(q.enqueue(pkt(3, 40)).is_ok());
    assert_eq!(q.bytes(), 100);

    assert_eq!(q.dequeue().expect("pkt").id, 1);
    assert_eq!(q.dequeue().expect("pkt").id, 3);
    assert!(q.is_empty());
    assert_eq!(q.bytes(), 0);
    assert!(q.dequeue().is_none());
    assert_eq!(q.peak_bytes(), 100);
}

#[test]
fn droptail_peak_tracks_high_watermark_not_current_level() {
    let mut q = DropTailQueue::new(1_000);
    q.enqueue(pkt(1, 300)).expect("fits");
    q.enqueue(pkt(2, 200)).expect("fits");
    q.dequeue();
    q.enqueue(pkt(3, 100)).expect("fits");
    assert_eq!(q.bytes(), 300);
    assert_eq!(q.peak_bytes(), 500);
    // 被丢弃的包不计入峰值
    assert!(q.enqueue(pkt(4, 800)).is_err());
    assert_eq!(q.peak_bytes(), 500);
}

#[test]
fn droptail_queue_zero_sized_packets_do_not_consume_capacity() {
    let mut q = DropTailQueue::new(10);
    assert!(q.enqueue(pkt(1, 0)).is_ok());
    assert!(q.enqueue(pkt(2, 0)).is_ok());
    assert_eq!(q.len(), 2);
    assert_eq!(q.bytes(), 0);
    assert_eq!(q.dequeue().expect("pkt").id, 1);
    assert_eq!(q.dequeue().expect("pkt").id, 2);
    assert!(q.dequeue().is_none());
}

#[test]
fn mem_from_pkt_scales_by_default_packet_size() {
    assert_eq!(mem_from_pkt(0), 0);
    assert_eq!(mem_from_pkt(8), 8 * DEFAULT_PKT_BYTES);
    assert_eq!(mem_from_pkt(u64::MAX), u64::MAX);
}
