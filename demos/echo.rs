use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wsrpc::{
    dispatch_table, name,
    types::{arg, to_value},
    Args, Connection, ConnectionConfig, DispatchTable, HandlerError, Kwargs, Outcome, RpcFunction,
    Server, Value,
};

pub struct Hello;

impl RpcFunction for Hello {
    name!("Hello");

    fn call(&self, args: Args, _kwargs: Kwargs) -> Result<Value, HandlerError> {
        let name: String = arg(&args, 0)?;
        Ok(to_value(format!("Hello, {name}!"))?)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut table = DispatchTable::new();
    table.add(Hello);
    let server = Server::new(table).on_connect(|conn| {
        let _ = conn.invoke("Log", vec![json!("welcome")], Kwargs::new());
    });
    tokio::spawn(server.serve_tcp(9000));
    tokio::time::sleep(Duration::from_secs_f32(0.01)).await;

    let client_table = dispatch_table! {
        "Log" => |args, _| {
            let line: String = arg(&args, 0)?;
            println!("server says: {line}");
            Ok(Value::Null)
        },
    };
    let conn = Connection::connect(&ConnectionConfig::default(), client_table, None);
    conn.opened().await?;

    conn.request(
        "Hello",
        vec![json!("world")],
        Kwargs::new(),
        |outcome: Outcome| println!("{}", outcome.result),
        None,
    )?;
    let retval = conn.call("Hello", vec![json!("again")], Kwargs::new()).await?;
    println!("{retval}");

    conn.close();
    conn.closed().await;
    Ok(())
}
