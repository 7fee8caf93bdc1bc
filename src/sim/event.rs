//! 事件与仿真世界
//!
//! 事件按值消费（`self: Box<Self>`），执行时拿到仿真器（用于继续调度/取消）和世界。
//! 世界通过 `as_any_mut` 向下转型成具体类型，例如 `NetWorld`。

use super::simulator::Simulator;
use std::any::Any;

pub trait Event: Send + 'static {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World);
}

pub trait World: Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// 每执行完一个事件调用一次
    fn on_tick(&mut self, _sim: &mut Simulator) {}
}
