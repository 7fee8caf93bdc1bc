//! MPTCP 选项编解码（RFC 6824 §3）
//!
//! 编码结果是 TCP 选项的数据部分：不含 kind(30) 与 length 两个字节，
//! 由 [`TcpHeader::add_option`] 补齐。所有多字节字段均为网络字节序。
//!
//! DSS 中的 SSN 字段携带子流的绝对序号（仿真中不做相对化），
//! data-level length 包含 DATA_FIN 占用的一个序号。

use std::net::Ipv4Addr;

use crate::proto::tcp::{OPT_MPTCP, TcpHeader};

use super::error::{MptcpError, Result};

const SUBTYPE_CAPABLE: u8 = 0x0;
const SUBTYPE_JOIN: u8 = 0x1;
const SUBTYPE_DSS: u8 = 0x2;
const SUBTYPE_ADD_ADDR: u8 = 0x3;
const SUBTYPE_REMOVE_ADDR: u8 = 0x4;

const MPTCP_VERSION: u8 = 0;
/// MP_CAPABLE 的 H 位：HMAC-SHA1
const CAPABLE_FLAG_SHA1: u8 = 0x01;
/// MP_JOIN 的 B 位：备份路径
const JOIN_FLAG_BACKUP: u8 = 0x01;

const DSS_FLAG_DATA_FIN: u8 = 0x10;
const DSS_FLAG_DSN8: u8 = 0x08;
const DSS_FLAG_MAPPING: u8 = 0x04;
const DSS_FLAG_ACK8: u8 = 0x02;
const DSS_FLAG_ACK: u8 = 0x01;

const ADD_ADDR_IPV4: u8 = 4;

/// MP_JOIN 的三种形态，按握手阶段区分
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Join {
    /// SYN：对端 token + 本端随机数
    Syn {
        token: u32,
        nonce: u32,
        addr_id: u8,
        backup: bool,
    },
    /// SYN/ACK：截断 HMAC + 本端随机数
    SynAck {
        truncated_hmac: u64,
        nonce: u32,
        addr_id: u8,
        backup: bool,
    },
    /// 第三个 ACK：完整 HMAC
    Ack { hmac: [u8; 20] },
}

/// DSS 中的映射部分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssMapping {
    pub dsn: u64,
    pub ssn: u32,
    /// data-level length（含 DATA_FIN）
    pub data_len: u16,
    pub data_fin: bool,
}

impl DssMapping {
    /// 映射覆盖的载荷字节数
    pub fn payload_len(&self) -> u16 {
        self.data_len.saturating_sub(u16::from(self.data_fin))
    }

    /// 只携带 DATA_FIN、不覆盖任何载荷
    pub fn is_pure_data_fin(&self) -> bool {
        self.data_fin && self.payload_len() == 0
    }

    /// DATA_FIN 占用的 DSN
    pub fn data_fin_dsn(&self) -> Option<u64> {
        self.data_fin.then(|| self.dsn.wrapping_add(self.payload_len() as u64))
    }
}

/// Data Sequence Signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dss {
    pub data_ack: Option<u64>,
    pub mapping: Option<DssMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MptcpOption {
    /// MP_CAPABLE：SYN/SYN-ACK 只带发送方密钥，第三个 ACK 带双方密钥
    Capable {
        sender_key: u64,
        receiver_key: Option<u64>,
    },
    Join(Join),
    Dss(Dss),
    AddAddr {
        addr_id: u8,
        addr: Ipv4Addr,
        port: Option<u16>,
    },
    RemoveAddr { ids: Vec<u8> },
}

impl MptcpOption {
    /// 编码为选项数据（不含 kind/length）
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        match self {
            MptcpOption::Capable {
                sender_key,
                receiver_key,
            } => {
                out.push((SUBTYPE_CAPABLE << 4) | MPTCP_VERSION);
                out.push(CAPABLE_FLAG_SHA1);
                out.extend_from_slice(&sender_key.to_be_bytes());
                if let Some(k) = receiver_key {
                    out.extend_from_slice(&k.to_be_bytes());
                }
            }
            MptcpOption::Join(Join::Syn {
                token,
                nonce,
                addr_id,
                backup,
            }) => {
                out.push((SUBTYPE_JOIN << 4) | backup_bit(*backup));
                out.push(*addr_id);
                out.extend_from_slice(&token.to_be_bytes());
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            MptcpOption::Join(Join::SynAck {
                truncated_hmac,
                nonce,
                addr_id,
                backup,
            }) => {
                out.push((SUBTYPE_JOIN << 4) | backup_bit(*backup));
                out.push(*addr_id);
                out.extend_from_slice(&truncated_hmac.to_be_bytes());
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            MptcpOption::Join(Join::Ack { hmac }) => {
                out.push(SUBTYPE_JOIN << 4);
                out.push(0);
                out.extend_from_slice(hmac);
            }
            MptcpOption::Dss(dss) => {
                let mut flags = 0u8;
                if dss.data_ack.is_some() {
                    flags |= DSS_FLAG_ACK | DSS_FLAG_ACK8;
                }
                if let Some(m) = &dss.mapping {
                    flags |= DSS_FLAG_MAPPING | DSS_FLAG_DSN8;
                    if m.data_fin {
                        flags |= DSS_FLAG_DATA_FIN;
                    }
                }
                out.push(SUBTYPE_DSS << 4);
                out.push(flags);
                if let Some(ack) = dss.data_ack {
                    out.extend_from_slice(&ack.to_be_bytes());
                }
                if let Some(m) = &dss.mapping {
                    out.extend_from_slice(&m.dsn.to_be_bytes());
                    out.extend_from_slice(&m.ssn.to_be_bytes());
                    out.extend_from_slice(&m.data_len.to_be_bytes());
                }
            }
            MptcpOption::AddAddr {
                addr_id,
                addr,
                port,
            } => {
                out.push((SUBTYPE_ADD_ADDR << 4) | ADD_ADDR_IPV4);
                out.push(*addr_id);
                out.extend_from_slice(&addr.octets());
                if let Some(p) = port {
                    out.extend_from_slice(&p.to_be_bytes());
                }
            }
            MptcpOption::RemoveAddr { ids } => {
                out.push(SUBTYPE_REMOVE_ADDR << 4);
                out.extend_from_slice(ids);
            }
        }
        out
    }

    /// 从选项数据解码
    pub fn decode(data: &[u8]) -> Result<MptcpOption> {
        let first = *data.first().ok_or(MptcpError::MalformedOption("empty option"))?;
        let subtype = first >> 4;
        // 选项总长 = 数据长度 + kind/length 两字节
        let total = data.len() + 2;
        let mut r = Reader::new(data);
        r.skip(1)?;
        match subtype {
            SUBTYPE_CAPABLE => {
                if first & 0x0f != MPTCP_VERSION {
                    return Err(MptcpError::MalformedOption("unsupported MPTCP version"));
                }
                let _flags = r.u8()?;
                match total {
                    12 => Ok(MptcpOption::Capable {
                        sender_key: r.u64()?,
                        receiver_key: None,
                    }),
                    20 => Ok(MptcpOption::Capable {
                        sender_key: r.u64()?,
                        receiver_key: Some(r.u64()?),
                    }),
                    _ => Err(MptcpError::MalformedOption("bad MP_CAPABLE length")),
                }
            }
            SUBTYPE_JOIN => {
                let backup = first & JOIN_FLAG_BACKUP != 0;
                let addr_id = r.u8()?;
                match total {
                    12 => Ok(MptcpOption::Join(Join::Syn {
                        token: r.u32()?,
                        nonce: r.u32()?,
                        addr_id,
                        backup,
                    })),
                    16 => Ok(MptcpOption::Join(Join::SynAck {
                        truncated_hmac: r.u64()?,
                        nonce: r.u32()?,
                        addr_id,
                        backup,
                    })),
                    24 => {
                        let mut hmac = [0u8; 20];
                        hmac.copy_from_slice(r.take(20)?);
                        Ok(MptcpOption::Join(Join::Ack { hmac }))
                    }
                    _ => Err(MptcpError::MalformedOption("bad MP_JOIN length")),
                }
            }
            SUBTYPE_DSS => {
                let flags = r.u8()?;
                let data_ack = if flags & DSS_FLAG_ACK != 0 {
                    Some(if flags & DSS_FLAG_ACK8 != 0 {
                        r.u64()?
                    } else {
                        r.u32()? as u64
                    })
                } else {
                    None
                };
                let mapping = if flags & DSS_FLAG_MAPPING != 0 {
                    let dsn = if flags & DSS_FLAG_DSN8 != 0 {
                        r.u64()?
                    } else {
                        r.u32()? as u64
                    };
                    Some(DssMapping {
                        dsn,
                        ssn: r.u32()?,
                        data_len: r.u16()?,
                        data_fin: flags & DSS_FLAG_DATA_FIN != 0,
                    })
                } else {
                    None
                };
                // 未协商校验和；若对端仍携带 2 字节校验和则忽略
                match r.remaining() {
                    0 => {}
                    2 if mapping.is_some() => {}
                    _ => return Err(MptcpError::MalformedOption("bad DSS length")),
                }
                Ok(MptcpOption::Dss(Dss { data_ack, mapping }))
            }
            SUBTYPE_ADD_ADDR => {
                if first & 0x0f != ADD_ADDR_IPV4 {
                    return Err(MptcpError::MalformedOption("only IPv4 ADD_ADDR is supported"));
                }
                let addr_id = r.u8()?;
                let o = r.take(4)?;
                let addr = Ipv4Addr::new(o[0], o[1], o[2], o[3]);
                let port = match r.remaining() {
                    0 => None,
                    2 => Some(r.u16()?),
                    _ => return Err(MptcpError::MalformedOption("bad ADD_ADDR length")),
                };
                Ok(MptcpOption::AddAddr {
                    addr_id,
                    addr,
                    port,
                })
            }
            SUBTYPE_REMOVE_ADDR => {
                let ids = r.rest().to_vec();
                if ids.is_empty() {
                    return Err(MptcpError::MalformedOption("REMOVE_ADDR without ids"));
                }
                Ok(MptcpOption::RemoveAddr { ids })
            }
            _ => Err(MptcpError::MalformedOption("unsupported MPTCP subtype")),
        }
    }

    /// 选项在线上的总字节数（含 kind/length）
    pub fn wire_len(&self) -> usize {
        self.encode().len() + 2
    }

    /// 附加到 TCP 头部
    pub fn attach(&self, header: &mut TcpHeader) {
        header.add_option(OPT_MPTCP, self.encode());
    }
}

/// 解码头部携带的所有 MPTCP 选项
pub fn parse_options(header: &TcpHeader) -> Result<Vec<MptcpOption>> {
    header.options(OPT_MPTCP).map(MptcpOption::decode).collect()
}

/// 头部是否携带任何 MPTCP 选项
pub fn has_mptcp_option(header: &TcpHeader) -> bool {
    header.get_option(OPT_MPTCP).is_some()
}

fn backup_bit(backup: bool) -> u8 {
    if backup { JOIN_FLAG_BACKUP } else { 0 }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(MptcpError::MalformedOption("truncated option"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
