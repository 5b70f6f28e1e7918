use clap::Parser;
use jelatine_runtime::VmConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Jelatine, an embedded CLDC virtual machine")]
pub struct Args {
    #[arg(
        short = 'c',
        long = "classpath",
        visible_alias = "cp",
        value_delimiter = ':',
        help = "Classpath directories; use ':' as separator"
    )]
    pub class_path: Vec<PathBuf>,
    #[arg(
        short = 'b',
        long = "bootclasspath",
        value_delimiter = ':',
        help = "Boot classpath directories holding the core classes"
    )]
    pub boot_class_path: Vec<PathBuf>,
    #[arg(
        short = 's',
        long = "size",
        default_value_t = 1024 * 1024,
        help = "Heap size in bytes"
    )]
    pub heap_size: usize,
    #[arg(
        long = "stack-size",
        default_value_t = 64 * 1024,
        help = "Per-thread Java stack size in bytes"
    )]
    pub stack_size: usize,
    #[arg(
        long = "trace",
        help = "Enable runtime tracing (same syntax as RUST_LOG)"
    )]
    pub trace: Option<String>,
    #[arg(help = "Main class, dot or slash separated (e.g. com.example.Main)")]
    pub main_class: String,
    #[arg(trailing_var_arg = true, help = "Arguments passed to the main method")]
    pub args: Vec<String>,
}

fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let _ = tracing_log::LogTracer::init();
}

#[hotpath::main]
fn main() {
    let mut args = Args::parse();
    init_tracing(args.trace.as_deref());

    if args.class_path.is_empty() {
        if let Ok(current_dir) = std::env::current_dir() {
            args.class_path.push(current_dir);
        }
    }

    let config = VmConfig {
        class_path: args.class_path,
        boot_class_path: args.boot_class_path,
        heap_size: args.heap_size,
        stack_size: args.stack_size,
        main_class: args.main_class,
        args: args.args,
    };

    match jelatine_runtime::start(config) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("jelatine: {}", err);
            std::process::exit(1);
        }
    }
}
