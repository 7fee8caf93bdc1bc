use crate::proto::tcp::{RxBuffer, SeqNum, SequenceSpace, TxBuffer};

#[test]
fn seq_num_comparisons_wrap_around() {
    let near_max = SeqNum(u32::MAX - 10);
    let wrapped = near_max.advance(20);
    assert_eq!(wrapped, SeqNum(9));
    assert!(near_max.before(wrapped));
    assert!(wrapped.after(near_max));
    assert_eq!(wrapped.offset_from(near_max), 20);
    assert_eq!(near_max.distance_to(wrapped), 20);
    assert_eq!(wrapped.distance_to(near_max), 0);
    assert_eq!(near_max.max_seq(wrapped), wrapped);
    assert!(wrapped.before_or_eq(wrapped));
}

#[test]
fn dsn_space_is_plain_u64() {
    let a: u64 = 1_000;
    assert_eq!(a.advance(24), 1_024);
    assert!(a.before(1_001));
    assert_eq!(a.distance_to(1_100), 100);
}

#[test]
fn tx_buffer_respects_capacity_and_discards_acked_prefix() {
    let mut tx = TxBuffer::new(SeqNum(100), 10);
    assert_eq!(tx.append(b"hello"), 5);
    assert_eq!(tx.append(b"world!!"), 5);
    assert_eq!(tx.free(), 0);
    assert_eq!(tx.head(), SeqNum(100));
    assert_eq!(tx.tail(), SeqNum(110));

    assert_eq!(tx.copy_range(SeqNum(103), 4), b"lowo".to_vec());
    // 越过尾部时截断
    assert_eq!(tx.copy_range(SeqNum(108), 10), b"ld".to_vec());

    assert_eq!(tx.discard_up_to(SeqNum(105)), 5);
    assert_eq!(tx.head(), SeqNum(105));
    assert_eq!(tx.free(), 5);
    assert_eq!(tx.copy_range(SeqNum(105), 5), b"world".to_vec());
}

#[test]
fn rx_buffer_reassembles_out_of_order_segments() {
    let mut rx = RxBuffer::new(SeqNum(0), 100);
    assert_eq!(rx.add(SeqNum(5), b"56789"), 0);
    assert!(rx.has_out_of_order());
    assert_eq!(rx.available(), 0);
    assert_eq!(rx.buffered(), 5);

    assert_eq!(rx.add(SeqNum(0), b"01234"), 10);
    assert!(!rx.has_out_of_order());
    assert_eq!(rx.available(), 10);
    assert_eq!(rx.next(), SeqNum(10));

    assert_eq!(rx.read(4), b"0123".to_vec());
    assert_eq!(rx.head(), SeqNum(4));
    assert_eq!(rx.read(100), b"456789".to_vec());
    assert!(rx.read(1).is_empty());
}

#[test]
fn rx_buffer_ignores_duplicates_and_truncates_at_window() {
    let mut rx = RxBuffer::new(SeqNum(0), 8);
    assert_eq!(rx.add(SeqNum(0), b"abcd"), 4);
    // 完全重复的段不推进
    assert_eq!(rx.add(SeqNum(0), b"abcd"), 0);
    // 部分重复只接收新字节
    assert_eq!(rx.add(SeqNum(2), b"cdef"), 2);
    assert_eq!(rx.room_at(SeqNum(6)), 2);
    // 窗口外的部分被截断
    assert_eq!(rx.add(SeqNum(6), b"ghij"), 2);
    assert_eq!(rx.free(), 0);
    assert_eq!(rx.read(8), b"abcdefgh".to_vec());
    assert_eq!(rx.free(), 8);
}
