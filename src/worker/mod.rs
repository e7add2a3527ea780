// Out-of-process inference worker: IPC protocol, child lifecycle,
// host-side supervisor, and the worker entry point with its pipelines.

pub mod ipc;
pub mod pipeline;
pub mod process;
pub mod supervisor;
pub mod worker_main;
