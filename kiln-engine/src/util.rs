use std::fmt::{Debug, Formatter, Write};

use tracing_subscriber::EnvFilter;

use crate::context::ExecutionContext;
use crate::runtime::TensorIoMode;

pub fn debug_vec_multiline<'a, T: Debug>(prefix: &'a str, values: &'a [T]) -> impl Debug + 'a {
    struct Wrapper<'a, T>(&'a str, &'a [T]);
    impl<'a, T: Debug> Debug for Wrapper<'a, T> {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            writeln!(f, "[")?;
            for v in self.1 {
                writeln!(f, "{}{}{:?},", self.0, self.0, v)?;
            }
            write!(f, "{}]", self.0)?;
            Ok(())
        }
    }
    Wrapper(prefix, values)
}

/// Install a `tracing` subscriber that logs to stderr.
///
/// The filter is `filter` if given, otherwise `RUST_LOG`, falling back to `warn`.
/// Installing a second subscriber is silently ignored.
pub fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One line per I/O tensor: index, direction, dtype, declared shape, concrete shape in `context` and name.
pub fn format_io_table(context: &ExecutionContext) -> String {
    let mut result = String::new();
    for (i, tensor) in context.engine().io_tensors().iter().enumerate() {
        let concrete = match context.tensor_shape(&tensor.name) {
            Ok(shape) => shape.to_string(),
            Err(_) => "(unset)".to_owned(),
        };
        let direction = match tensor.mode {
            TensorIoMode::Input => "Input ",
            TensorIoMode::Output => "Output",
        };
        writeln!(
            &mut result,
            "[{:2}]{}-> {} {} {} {}",
            i, direction, tensor.dtype, tensor.shape, concrete, tensor.name
        )
        .unwrap();
    }
    result
}
