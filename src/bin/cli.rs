use clap::Parser;
use redshard::{Config, Error, RespValue, ShardConfig};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host (ignored with --config)
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port (ignored with --config)
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Password sent with AUTH (ignored with --config)
    #[arg(short = 'a', long)]
    auth: Option<String>,

    /// Database index (ignored with --config)
    #[arg(short = 'n', long, default_value_t = 0)]
    db: i64,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Send the command this many times in one pipeline
    #[arg(long, default_value_t = 1)]
    pipeline: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Command followed by its arguments; the first argument picks the shard
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("redshard={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    // Create configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config {
            shards: vec![ShardConfig {
                host: args.host.clone(),
                port: args.port,
                password: args.auth.clone().filter(|p| !p.is_empty()),
                database: args.db,
                ..Default::default()
            }],
            ..Default::default()
        }
    };
    config.validate()?;
    info!(shards = config.shards.len(), "Configuration loaded");

    if args.pipeline == 0 {
        anyhow::bail!("--pipeline must be >= 1");
    }

    let pool = config.build_pool()?;
    let result = run(&pool, &args);
    if let Err(e) = pool.close() {
        warn!("Failed to close pool: {}", e);
    }
    result
}

fn run(pool: &redshard::ShardedClientPool, args: &Args) -> anyhow::Result<()> {
    let (command, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;
    let command_args: Vec<&[u8]> = rest.iter().map(|a| a.as_bytes()).collect();

    let mut sharded = pool.borrow()?;
    let client = match rest.first() {
        Some(key) => sharded.shard(key),
        None => &mut sharded.all_shards_mut()[0],
    };
    debug!(endpoint = %client.endpoint(), command = %command, "Routing command");

    let outcome = (|| -> redshard::Result<Vec<Result<RespValue, redshard::DataError>>> {
        for _ in 0..args.pipeline {
            client.send_command(command.as_bytes(), &command_args)?;
        }
        client.connection_mut().get_all(0)
    })();

    match outcome {
        Ok(replies) => {
            let numbered = replies.len() > 1;
            for (index, reply) in replies.into_iter().enumerate() {
                let text = match reply {
                    Ok(value) => format_reply(&value, 0),
                    Err(e) => format!("(error) {}\n", e),
                };
                if numbered {
                    print!("[{}] {}", index + 1, text);
                } else {
                    print!("{}", text);
                }
            }
            Ok(())
        }
        Err(e) => {
            if e.is_connection_error() {
                if let Err(return_err) = pool.return_broken(sharded) {
                    warn!("Failed to return broken client: {}", return_err);
                }
            }
            Err(report(e))
        }
    }
}

fn report(e: Error) -> anyhow::Error {
    match e {
        Error::Data(data) => anyhow::anyhow!("(error) {}", data),
        other => other.into(),
    }
}

/// Render a reply the way redis-cli does.
fn format_reply(value: &RespValue, indent: usize) -> String {
    let mut out = String::new();
    match value {
        RespValue::SimpleString(s) => {
            let _ = writeln!(out, "{}", String::from_utf8_lossy(s));
        }
        RespValue::Error(e) => {
            let _ = writeln!(out, "(error) {}", e);
        }
        RespValue::Integer(n) => {
            let _ = writeln!(out, "(integer) {}", n);
        }
        RespValue::BulkString(Some(b)) => {
            let _ = writeln!(out, "{:?}", String::from_utf8_lossy(b));
        }
        RespValue::BulkString(None) | RespValue::Array(None) => {
            out.push_str("(nil)\n");
        }
        RespValue::Array(Some(items)) if items.is_empty() => {
            out.push_str("(empty array)\n");
        }
        RespValue::Array(Some(items)) => {
            let width = items.len().to_string().len();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(&" ".repeat(indent));
                }
                let label = format!("{:>width$}) ", i + 1, width = width);
                out.push_str(&label);
                out.push_str(&format_reply(item, indent + label.len()));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn unreachable_shard_client_is_not_kept() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = Config {
            shards: vec![ShardConfig {
                host: "127.0.0.1".to_string(),
                port,
                timeout_ms: 200,
                ..Default::default()
            }],
            ..Default::default()
        };
        let pool = config.build_pool().unwrap();
        let args = Args::parse_from(["redshard-cli", "GET", "key"]);

        assert!(run(&pool, &args).is_err());
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn nested_arrays_render_like_redis_cli() {
        let value = RespValue::Array(Some(vec![
            RespValue::Integer(1),
            RespValue::Array(Some(vec![RespValue::BulkString(None)])),
        ]));
        assert_eq!(format_reply(&value, 0), "1) (integer) 1\n2) 1) (nil)\n");
    }
}
