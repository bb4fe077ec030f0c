pub mod init_tracer;

pub use init_tracer::{
    global_filter_directives, init_global_filter_layer, init_gc_tracing, init_otel_layer,
    init_panic_tracing_hook, init_stdout_layer, init_tracing, OtelFilter, OtelFilterLevel,
};
