/// 传输层
///
/// - `runner`：单线程任务执行器与线程本地状态
/// - `dispatcher`：端点与会话表
/// - `io_loop`：UDP 读循环与定时器
/// - `server` / `client`：面向应用的入口
/// - `factory`：进程级初始化
pub mod client;
pub(crate) mod dispatcher;
pub mod factory;
pub(crate) mod io_loop;
pub(crate) mod packet_writer;
pub mod runner;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use client::QuicClient;
pub use factory::{FactoryOptions, QuicTransportFactory};
pub use runner::TaskRunner;
pub use server::QuicServer;
