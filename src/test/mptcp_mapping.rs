use crate::proto::mptcp::{Mapping, MappingContainer};
use crate::proto::tcp::SeqNum;

#[test]
fn mapping_translates_ssn_to_dsn() {
    let m = Mapping::new(5_000, SeqNum(100), 50);
    assert_eq!(m.tail_dsn(), 5_049);
    assert_eq!(m.tail_ssn(), SeqNum(149));
    assert!(m.covers_ssn(SeqNum(100)));
    assert!(m.covers_ssn(SeqNum(149)));
    assert!(!m.covers_ssn(SeqNum(150)));
    assert!(!m.covers_ssn(SeqNum(99)));
    assert!(m.covers_dsn(5_010));
    assert_eq!(m.dsn_for_ssn(SeqNum(110)), Some(5_010));
    assert_eq!(m.dsn_for_ssn(SeqNum(150)), None);
    assert_eq!(m.to_string(), "DSN [5000..5049] <-> SSN [100..149]");
}

#[test]
fn mapping_handles_ssn_wraparound() {
    let m = Mapping::new(0, SeqNum(u32::MAX - 4), 10);
    assert!(m.covers_ssn(SeqNum(2)));
    assert_eq!(m.tail_ssn(), SeqNum(4));
    assert_eq!(m.dsn_for_ssn(SeqNum(0)), Some(5));
}

#[test]
fn mapping_handles_dsn_wraparound() {
    let m = Mapping::new(u64::MAX - 9, SeqNum(1_000), 20);
    assert_eq!(m.tail_dsn(), 9);
    assert!(m.covers_dsn(u64::MAX));
    assert!(m.covers_dsn(0));
    assert!(m.covers_dsn(9));
    assert!(!m.covers_dsn(10));
    assert!(!m.covers_dsn(u64::MAX - 10));
    assert_eq!(m.dsn_for_ssn(SeqNum(1_010)), Some(0));
    assert_eq!(m.dsn_for_ssn(SeqNum(1_019)), Some(9));
}

#[test]
fn data_fin_only_mapping_covers_nothing() {
    let m = Mapping::data_fin_only(777);
    assert!(m.is_empty());
    assert!(m.is_data_fin());
    assert!(!m.covers_ssn(SeqNum(0)));
    assert_eq!(m.tail_dsn(), 777);
    assert!(m.to_string().ends_with("+DFIN"));
}

#[test]
fn container_rejects_overlap_and_empty_mappings() {
    let mut c = MappingContainer::new();
    assert!(c.add_mapping(Mapping::new(0, SeqNum(0), 100)));
    assert!(c.add_mapping(Mapping::new(300, SeqNum(200), 100)));
    assert!(!c.add_mapping(Mapping::new(900, SeqNum(50), 10)));
    assert!(!c.add_mapping(Mapping::new(900, SeqNum(150), 60)));
    assert!(!c.add_mapping(Mapping::data_fin_only(1_000)));
    // 填补空洞保持排序
    assert!(c.add_mapping(Mapping::new(100, SeqNum(100), 100)));
    assert_eq!(c.len(), 3);

    let heads: Vec<_> = c.iter().map(|m| m.head_ssn()).collect();
    assert_eq!(heads, vec![SeqNum(0), SeqNum(100), SeqNum(200)]);
    assert_eq!(c.oldest().map(|m| m.head_dsn()), Some(0));
}

#[test]
fn container_lookup_and_first_unmapped_ssn() {
    let mut c = MappingContainer::new();
    assert_eq!(c.first_unmapped_ssn(SeqNum(42)), SeqNum(42));

    let a = Mapping::new(1_000, SeqNum(10), 20);
    let b = Mapping::new(1_020, SeqNum(30), 20);
    assert!(c.add_mapping(a));
    assert!(c.add_mapping(b));

    assert_eq!(c.get_mapping_for_ssn(SeqNum(35)), Some(b));
    assert_eq!(c.get_mapping_for_ssn(SeqNum(50)), None);
    assert_eq!(c.first_unmapped_ssn(SeqNum(42)), SeqNum(50));
    assert_eq!(c.mappings_starting_from_ssn(SeqNum(11)), vec![b]);
    assert_eq!(c.mappings_starting_from_ssn(SeqNum(10)), vec![a, b]);

    assert!(c.contains(&a));
    assert!(c.discard_mapping(&a));
    assert!(!c.discard_mapping(&a));
    assert_eq!(c.oldest(), Some(b));
}

#[test]
fn container_discard_where_returns_removed() {
    let mut c = MappingContainer::new();
    for i in 0..4u32 {
        assert!(c.add_mapping(Mapping::new(u64::from(i) * 10, SeqNum(i * 10), 10)));
    }
    let removed = c.discard_where(|m| m.tail_dsn() < 20);
    assert_eq!(removed.len(), 2);
    assert_eq!(c.len(), 2);
    assert_eq!(c.clear().len(), 2);
    assert!(c.is_empty());
}
