//! 仿真世界：网络（含其上的 MPTCP 协议栈）

use super::network::Network;
use crate::sim::World;
use std::any::Any;

#[derive(Default)]
pub struct NetWorld {
    pub net: Network,
}

impl NetWorld {
    /// 事件拿到的是 `&mut dyn World`；本 crate 的事件只在 `NetWorld` 上运行
    pub fn from_world(world: &mut dyn World) -> &mut NetWorld {
        world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld")
    }
}

impl World for NetWorld {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
