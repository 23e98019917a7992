pub mod instrument;
pub mod order;

pub use instrument::{InstrumentKey, InstrumentKeyError, PositionType};
pub use order::{ExecutionHandshake, ExpectedDelta, HandshakeStatus, OperationType, Order};
