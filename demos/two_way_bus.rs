use async_trait::async_trait;
use serde_json::{json, Value};
use xbus::{
    connect_pair, BusConfig, BusError, BusResult, ConnectOptions, ErrorCode, ProtocolHandler,
};

// Function ids the generated stubs would normally carry.
const FN_ADD: u32 = 32;
const FN_ECHO: u32 = 33;

struct MathHost;

#[async_trait]
impl ProtocolHandler for MathHost {
    async fn dispatch(&self, function_id: u32, args: Vec<Value>) -> BusResult<Option<Value>> {
        match function_id {
            FN_ADD => {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                println!("[Host] add{args:?} = {sum}");
                Ok(Some(json!(sum)))
            }
            FN_ECHO => {
                let message = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| BusError::new(ErrorCode::InvalidRequestData))?;
                println!("[Host] echo({message:?})");
                Ok(Some(json!({ "message": message, "length": message.len() })))
            }
            _ => Err(BusError::new(ErrorCode::UnknownFunction)),
        }
    }
}

struct ProgressClient;

#[async_trait]
impl ProtocolHandler for ProgressClient {
    async fn dispatch(&self, _function_id: u32, args: Vec<Value>) -> BusResult<Option<Value>> {
        println!("[Client] progress notification: {args:?}");
        Ok(Some(Value::Null))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Both ends of the bus in one process; across real context boundaries
    // the two sides would each call `connect` over their own transport.
    let (client_side, host_side) = connect_pair(
        BusConfig::new().protocol("math", "MathClient", "MathHost", ProgressClient),
        BusConfig::new().protocol("math", "MathHost", "MathClient", MathHost),
        ConnectOptions::default(),
    )
    .await?;

    let math = client_side.sender("math")?;

    println!("[Client] calling add(10, 32)");
    let sum = math.call(FN_ADD, vec![json!(10), json!(32)]).await?;
    println!("[Client] result: {sum}");

    println!("[Client] calling echo(\"hello, bus\")");
    let echoed = math.call(FN_ECHO, vec![json!("hello, bus")]).await?;
    println!("[Client] result: {echoed}");

    // calls flow the other way over the same connection
    let progress = host_side.sender("math")?;
    progress.call_void(FN_ADD, vec![json!("50%")]).await?;

    // unknown function ids come back as typed errors, not hangs
    match math.call(99, vec![]).await {
        Ok(_) => println!("[Client] unexpected success"),
        Err(err) => println!("[Client] expected error: {err}"),
    }

    client_side.close();
    Ok(())
}
