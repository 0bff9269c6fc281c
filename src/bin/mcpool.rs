use std::{io, path::PathBuf, time::Duration};

use mcpool::{Client, ClientConfig, Value};
use num_bigint::BigInt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

fn key_arg() -> clap::Arg {
  clap::Arg::new("key").required(true)
}

fn store_command(name: &'static str) -> clap::Command {
  clap::Command::new(name)
    .arg(key_arg())
    .arg(clap::Arg::new("value").required(true))
    .arg(
      clap::Arg::new("type")
        .long("type")
        .default_value("text")
        .value_parser(["text", "int", "json"]),
    )
    .arg(
      clap::Arg::new("expire")
        .short('e')
        .long("expire")
        .default_value("0")
        .value_parser(clap::value_parser!(u32)),
    )
    .arg(
      clap::Arg::new("compress")
        .long("compress")
        .value_name("MIN-LEN")
        .default_value("0")
        .value_parser(clap::value_parser!(usize)),
    )
}

fn delta_command(name: &'static str) -> clap::Command {
  clap::Command::new(name).arg(key_arg()).arg(
    clap::Arg::new("delta")
      .default_value("1")
      .value_parser(clap::value_parser!(u64)),
  )
}

#[tokio::main]
async fn main() -> io::Result<()> {
  let cmd = clap::Command::new("mcpool")
    .version("0.1")
    .subcommand_required(true)
    .arg(
      clap::Arg::new("host")
        .short('H')
        .long("host")
        .action(clap::ArgAction::Append)
        .default_value("127.0.0.1:11211"),
    )
    .arg(
      clap::Arg::new("timeout")
        .short('t')
        .long("timeout")
        .value_name("SECONDS")
        .value_parser(clap::value_parser!(f64)),
    )
    .arg(
      clap::Arg::new("config-file")
        .long("config-file")
        .value_name("JSON-FILE")
        .conflicts_with("host")
        .value_parser(clap::value_parser!(PathBuf)),
    )
    .subcommand(
      clap::Command::new("get")
        .arg(clap::Arg::new("keys").required(true).num_args(1..))
        .arg(clap::Arg::new("prefix").long("prefix").default_value("")),
    )
    .subcommand(clap::Command::new("gets").arg(key_arg()))
    .subcommand(store_command("set"))
    .subcommand(store_command("add"))
    .subcommand(store_command("replace"))
    .subcommand(
      store_command("cas").arg(
        clap::Arg::new("cas")
          .long("cas")
          .required(true)
          .value_parser(clap::value_parser!(u64)),
      ),
    )
    .subcommand(clap::Command::new("delete").arg(key_arg()))
    .subcommand(delta_command("incr"))
    .subcommand(delta_command("decr"));

  let mut matches = cmd.get_matches();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .with_filter(
          tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        ),
    )
    .init();

  let mut config = match matches.remove_one::<PathBuf>("config-file") {
    Some(path) => {
      let bytes = tokio::fs::read(path).await?;
      serde_json::from_slice::<ClientConfig>(bytes.as_slice()).map_err(|err| {
        io::Error::new(
          io::ErrorKind::InvalidData,
          format!("Failed to parse client configuration: {err}"),
        )
      })?
    }
    None => ClientConfig::new(matches.remove_many::<String>("host").into_iter().flatten()),
  };
  if let Some(timeout) = matches.remove_one::<f64>("timeout") {
    let timeout = Duration::try_from_secs_f64(timeout).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    config = config.socket_timeout(timeout);
  }

  let client = Client::new(config).map_err(to_io)?;
  let result = run(&client, matches).await;
  client.shutdown();
  result
}

async fn run(client: &Client, mut matches: clap::ArgMatches) -> io::Result<()> {
  let Some((name, mut args)) = matches.remove_subcommand() else {
    return Ok(());
  };

  match name.as_str() {
    "get" => {
      let keys = args.remove_many::<String>("keys").into_iter().flatten().collect::<Vec<_>>();
      let prefix = args.remove_one::<String>("prefix").unwrap_or_default();
      if let [key] = keys.as_slice() {
        let key = format!("{prefix}{key}");
        match client.get(&key).await.map_err(to_io)? {
          Some(value) => println!("{value}"),
          None => eprintln!("{key}: not found"),
        }
      } else {
        let values = client.get_multi(&keys, &prefix).await.map_err(to_io)?;
        for key in &keys {
          match values.get(key) {
            Some(value) => println!("{key}\t{value}"),
            None => eprintln!("{key}: not found"),
          }
        }
      }
    }
    "gets" => {
      let key = required::<String>(&mut args, "key")?;
      match client.gets(&key).await.map_err(to_io)? {
        Some((value, cas)) => println!("{value}\t{cas}"),
        None => eprintln!("{key}: not found"),
      }
    }
    "set" | "add" | "replace" | "cas" => {
      let key = required::<String>(&mut args, "key")?;
      let value = parse_value(
        &required::<String>(&mut args, "type")?,
        required::<String>(&mut args, "value")?,
      )?;
      let expire = required::<u32>(&mut args, "expire")?;
      let compress = required::<usize>(&mut args, "compress")?;

      let stored = match name.as_str() {
        "set" => client.set(&key, value, expire, compress).await,
        "add" => client.add(&key, value, expire, compress).await,
        "replace" => client.replace(&key, value, expire, compress).await,
        _ => {
          let cas = required::<u64>(&mut args, "cas")?;
          client.cas(&key, cas, value, expire).await
        }
      }
      .map_err(to_io)?;
      println!("{}", if stored { "STORED" } else { "NOT_STORED" });
    }
    "delete" => {
      let key = required::<String>(&mut args, "key")?;
      let deleted = client.delete(&key).await.map_err(to_io)?;
      println!("{}", if deleted { "DELETED" } else { "NOT_DELETED" });
    }
    "incr" | "decr" => {
      let key = required::<String>(&mut args, "key")?;
      let delta = required::<u64>(&mut args, "delta")?;
      let value = if name == "incr" {
        client.incr(&key, delta).await
      } else {
        client.decr(&key, delta).await
      }
      .map_err(to_io)?;
      match value {
        Some(value) => println!("{value}"),
        None => eprintln!("{key}: not found"),
      }
    }
    _ => {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unknown subcommand {name}"),
      ))
    }
  }

  Ok(())
}

fn required<T: Clone + Send + Sync + 'static>(args: &mut clap::ArgMatches, name: &str) -> io::Result<T> {
  args
    .remove_one::<T>(name)
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("missing argument {name}")))
}

fn parse_value(kind: &str, raw: String) -> io::Result<Value> {
  let invalid = |err: String| io::Error::new(io::ErrorKind::InvalidInput, err);
  match kind {
    "int" => raw
      .parse::<BigInt>()
      .map(Value::from)
      .map_err(|err| invalid(err.to_string())),
    "json" => serde_json::from_str::<serde_json::Value>(&raw)
      .map(Value::from)
      .map_err(|err| invalid(err.to_string())),
    _ => Ok(Value::from(raw)),
  }
}

fn to_io(err: mcpool::Error) -> io::Error {
  match err {
    mcpool::Error::Io(err) => err,
    err => io::Error::new(io::ErrorKind::Other, err),
  }
}
