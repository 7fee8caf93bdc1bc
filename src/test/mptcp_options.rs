use std::net::{Ipv4Addr, SocketAddrV4};

use crate::proto::mptcp::{Dss, DssMapping, Join, MptcpError, MptcpOption, has_mptcp_option, parse_options};
use crate::proto::tcp::{OPT_MPTCP, SeqNum, TcpFlags, TcpHeader};

fn header() -> TcpHeader {
    TcpHeader::new(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5000),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000),
        TcpFlags::ACK,
        SeqNum(1),
        SeqNum(1),
        65_535,
    )
}

#[test]
fn option_lengths_follow_rfc6824() {
    let cases = [
        (
            MptcpOption::Capable {
                sender_key: 1,
                receiver_key: None,
            },
            12,
        ),
        (
            MptcpOption::Capable {
                sender_key: 1,
                receiver_key: Some(2),
            },
            20,
        ),
        (
            MptcpOption::Join(Join::Syn {
                token: 1,
                nonce: 2,
                addr_id: 3,
                backup: false,
            }),
            12,
        ),
        (
            MptcpOption::Join(Join::SynAck {
                truncated_hmac: 1,
                nonce: 2,
                addr_id: 3,
                backup: true,
            }),
            16,
        ),
        (MptcpOption::Join(Join::Ack { hmac: [7; 20] }), 24),
        (
            MptcpOption::Dss(Dss {
                data_ack: Some(9),
                mapping: None,
            }),
            12,
        ),
        (
            MptcpOption::Dss(Dss {
                data_ack: Some(9),
                mapping: Some(DssMapping {
                    dsn: 100,
                    ssn: 1,
                    data_len: 1400,
                    data_fin: false,
                }),
            }),
            26,
        ),
    ];
    for (opt, len) in cases {
        assert_eq!(opt.wire_len(), len, "{opt:?}");
        assert_eq!(MptcpOption::decode(&opt.encode()), Ok(opt));
    }
}

#[test]
fn header_carries_multiple_mptcp_options() {
    let mut h = header();
    assert!(!has_mptcp_option(&h));

    let dss = MptcpOption::Dss(Dss {
        data_ack: Some(0x1_0000_0000),
        mapping: Some(DssMapping {
            dsn: 0xdead_beef_0000,
            ssn: 77,
            data_len: 11,
            data_fin: true,
        }),
    });
    let add = MptcpOption::AddAddr {
        addr_id: 4,
        addr: Ipv4Addr::new(10, 0, 1, 1),
        port: Some(5000),
    };
    dss.attach(&mut h);
    add.attach(&mut h);

    assert!(has_mptcp_option(&h));
    assert_eq!(h.options(OPT_MPTCP).count(), 2);
    assert_eq!(parse_options(&h), Ok(vec![dss, add]));
}

#[test]
fn dss_mapping_accounts_for_data_fin() {
    let with_payload = DssMapping {
        dsn: 1_000,
        ssn: 10,
        data_len: 101,
        data_fin: true,
    };
    assert_eq!(with_payload.payload_len(), 100);
    assert!(!with_payload.is_pure_data_fin());
    assert_eq!(with_payload.data_fin_dsn(), Some(1_100));

    let pure = DssMapping {
        dsn: 2_000,
        ssn: 0,
        data_len: 1,
        data_fin: true,
    };
    assert_eq!(pure.payload_len(), 0);
    assert!(pure.is_pure_data_fin());
    assert_eq!(pure.data_fin_dsn(), Some(2_000));

    let plain = DssMapping {
        data_fin: false,
        ..with_payload
    };
    assert_eq!(plain.data_fin_dsn(), None);
}

#[test]
fn remove_addr_lists_ids() {
    let opt = MptcpOption::RemoveAddr { ids: vec![1, 5, 9] };
    assert_eq!(opt.wire_len(), 6);
    assert_eq!(MptcpOption::decode(&opt.encode()), Ok(opt));
}

#[test]
fn malformed_options_are_rejected() {
    let bad: [&[u8]; 6] = [
        &[],
        // MP_CAPABLE 版本 1
        &[0x01, 0x01, 0, 0, 0, 0, 0, 0, 0, 1],
        // MP_CAPABLE 长度不对
        &[0x00, 0x01, 0, 0, 0, 1],
        // DSS 声称带 8 字节 ACK 但数据不足
        &[0x20, 0x03, 0, 0, 0],
        // REMOVE_ADDR 没有 id
        &[0x40],
        // 未知子类型
        &[0x70, 0x00],
    ];
    for data in bad {
        match MptcpOption::decode(data) {
            Err(MptcpError::MalformedOption(_)) => {}
            other => panic!("{data:?} decoded as {other:?}"),
        }
    }
}

#[test]
fn malformed_option_fails_whole_header_parse() {
    let mut h = header();
    MptcpOption::Dss(Dss {
        data_ack: Some(1),
        mapping: None,
    })
    .attach(&mut h);
    h.add_option(OPT_MPTCP, vec![0x10, 0x00, 1]);
    assert!(matches!(parse_options(&h), Err(MptcpError::MalformedOption(_))));
}
