/*!
 * Monitoring
 * Tracing setup and timed spans
 */

mod tracer;

pub use tracer::{init_tracing, span_operation, OperationSpan};
