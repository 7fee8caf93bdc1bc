//! 链路空闲事件

use super::id::LinkId;
use super::net_world::NetWorld;
use crate::sim::{Event, Simulator, World};

/// 事件：链路在 depart 时刻发完当前 packet，接着从队列取下一个
#[derive(Debug)]
pub struct LinkReady {
    pub link_id: LinkId,
}

impl Event for LinkReady {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        NetWorld::from_world(world).net.on_link_ready(self.link_id, sim);
    }
}
