//! 拓扑构建

pub mod multipath;
