use std::io;

use vigil_core::{DataFlowDescriptor, VigilError};

/// 操作所处阶段：建连阶段的失败归为 `Connect`，已建立数据流上的失败归为 `Transport`。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Establish,
    Stream,
}

/// 描述一次底层操作对应的阶段与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub phase: Phase,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    phase: Phase::Establish,
    message: "resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    phase: Phase::Establish,
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    phase: Phase::Establish,
    message: "socket configure",
};
pub(crate) const BIND: OperationKind = OperationKind {
    phase: Phase::Establish,
    message: "udp bind",
};
pub(crate) const UDP_CONNECT: OperationKind = OperationKind {
    phase: Phase::Establish,
    message: "udp connect",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    phase: Phase::Stream,
    message: "tcp write",
};
pub(crate) const SEND: OperationKind = OperationKind {
    phase: Phase::Stream,
    message: "udp send",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    phase: Phase::Stream,
    message: "tcp shutdown",
};

/// 将 IO 错误映射为 [`VigilError`]，错误码与可重试分类由核心错误类型按阶段与 `io::ErrorKind` 给出。
pub(crate) fn map_io_error(
    kind: OperationKind,
    descriptor: &DataFlowDescriptor,
    error: io::Error,
) -> VigilError {
    match kind.phase {
        Phase::Establish => VigilError::connect(kind.message, descriptor.endpoint(), error),
        Phase::Stream => VigilError::transport(descriptor.id, kind.message, error),
    }
}

/// 在已关闭或断开的数据流上发送时返回的错误。
pub(crate) fn not_connected(kind: OperationKind, descriptor: &DataFlowDescriptor) -> VigilError {
    map_io_error(
        kind,
        descriptor,
        io::Error::new(io::ErrorKind::NotConnected, "data flow is not open"),
    )
}
