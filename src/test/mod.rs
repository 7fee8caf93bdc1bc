mod mock_io;

mod queues;
mod sim_time;
mod simulator;

mod topologies;
mod viz_meta;

mod tcp_seq_buffers;
mod tcp_state_rtt;

mod mptcp_crypto;
mod mptcp_e2e;
mod mptcp_lia;
mod mptcp_mapping;
mod mptcp_options;
mod mptcp_scheduler;
