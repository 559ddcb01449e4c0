// HTTP gateway: the node's external ingress and operational snapshots.
//
// POST /submit_data       {source_id, data_type, value_base64, nonce, metadata}
// POST /submit_signed_tx  {tx_data: <transaction dict>}
// GET  /health  /api/chain  /api/mempool  /api/peers
//
// Client mistakes surface as 4xx with a detail string; anything internal
// is a 5xx. The WALLET role binds loopback-only so the same surface acts
// as a local submission helper without exposing ingress.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::node::context::{NodeContext, NodeRole, SubmitError};
use crate::primitives::Transaction;

type Reply = Result<Value, (StatusCode, String)>;

#[derive(serde::Deserialize)]
struct DataSubmission {
    source_id: String,
    data_type: String,
    value_base64: String,
    nonce: u64,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(serde::Deserialize)]
struct SignedSubmission {
    tx_data: Value,
}

pub async fn start_gateway_server(
    ctx: Arc<NodeContext>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bind_ip = if ctx.role == NodeRole::Wallet { "127.0.0.1" } else { "0.0.0.0" };
    let addr: SocketAddr = format!("{bind_ip}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    eprintln!("[gateway] listening on http://{addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(state.clone(), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("[gateway] connection error: {e}");
            }
        });
    }
}

async fn handle_request(
    ctx: Arc<NodeContext>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let reply: Reply = match (method.as_str(), path.as_str()) {
        ("POST", "/submit_data") => handle_submit_data(&ctx, req).await,
        ("POST", "/submit_signed_tx") => handle_submit_signed_tx(&ctx, req).await,
        ("GET", "/health") => Ok(health(&ctx).await),
        ("GET", "/api/chain") => Ok(chain_snapshot(&ctx).await),
        ("GET", "/api/mempool") => Ok(mempool_snapshot(&ctx).await),
        ("GET", "/api/peers") => Ok(peers_snapshot(&ctx).await),
        ("POST", "/api/control/mining/start") => mining_control(&ctx, false),
        ("POST", "/api/control/mining/stop") => mining_control(&ctx, true),
        _ => Err((StatusCode::NOT_FOUND, format!("no handler for {method} {path}"))),
    };

    Ok(match reply {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err((status, detail)) => {
            json_response(status, &json!({ "status": "error", "detail": detail }))
        }
    })
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, (StatusCode, String)> {
    req.collect()
        .await
        .map(|b| b.to_bytes())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("unreadable body: {e}")))
}

fn submit_error_status(e: &SubmitError) -> StatusCode {
    match e {
        SubmitError::MempoolFull => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn handle_submit_data(ctx: &Arc<NodeContext>, req: Request<Incoming>) -> Reply {
    let body = read_body(req).await?;
    let submission: DataSubmission = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed submission: {e}")))?;

    let value = data_encoding::BASE64
        .decode(submission.value_base64.as_bytes())
        .map_err(|_| (StatusCode::BAD_REQUEST, "value is not valid base64".to_string()))?;

    let tx_hash = ctx
        .submit_external_data(
            submission.source_id,
            submission.data_type,
            value,
            submission.nonce,
            submission.metadata,
        )
        .await
        .map_err(|e| (submit_error_status(&e), e.to_string()))?;

    Ok(json!({ "status": "broadcasted", "tx_hash": tx_hash }))
}

async fn handle_submit_signed_tx(ctx: &Arc<NodeContext>, req: Request<Incoming>) -> Reply {
    let body = read_body(req).await?;
    let submission: SignedSubmission = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed submission: {e}")))?;
    let tx: Transaction = serde_json::from_value(submission.tx_data)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed transaction: {e}")))?;

    let tx_hash = ctx
        .submit_signed_transaction(tx)
        .await
        .map_err(|e| (submit_error_status(&e), e.to_string()))?;

    Ok(json!({ "status": "relayed", "tx_hash": tx_hash }))
}

async fn health(ctx: &Arc<NodeContext>) -> Value {
    let height = ctx.height().await;
    let mempool_size = ctx.mempool.lock().await.size();
    json!({
        "status": "online",
        "role": ctx.role.as_str(),
        "height": height,
        "mempool_size": mempool_size,
        "address": ctx.wallet.address(),
    })
}

async fn chain_snapshot(ctx: &Arc<NodeContext>) -> Value {
    let chain = ctx.chain.lock().await;
    let latest: Vec<Value> = chain
        .chain()
        .iter()
        .rev()
        .take(10)
        .map(|b| {
            let miner = b
                .data
                .first()
                .and_then(|tx| tx.entries.first())
                .map(|e| e.source_id.clone())
                .unwrap_or_else(|| "unknown".to_string());
            json!({
                "index": b.index,
                "hash": b.hash,
                "miner": miner,
                "tx_count": b.data.len(),
                "timestamp": b.timestamp,
            })
        })
        .collect();
    json!({ "length": chain.chain().len(), "latest_blocks": latest })
}

async fn mempool_snapshot(ctx: &Arc<NodeContext>) -> Value {
    let pool = ctx.mempool.lock().await;
    let transactions: Vec<Value> = pool
        .select(50)
        .iter()
        .map(|t| {
            json!({
                "tx_hash": t.tx_hash,
                "type": t.entries.first().map(|e| e.data_type.clone()).unwrap_or_default(),
                "source": t.entries.first().map(|e| e.source_id.clone()).unwrap_or_default(),
                "fee_rate": t.fee_rate,
            })
        })
        .collect();
    json!({ "count": pool.size(), "transactions": transactions })
}

async fn peers_snapshot(ctx: &Arc<NodeContext>) -> Value {
    let peers = ctx.peers.lock().await;
    let listed: Vec<Value> = peers
        .iter()
        .map(|(addr, info)| {
            json!({
                "addr": addr.to_string(),
                "state": format!("{:?}", info.state),
                "best_height": info.best_height,
                "outbound": info.is_outbound,
            })
        })
        .collect();
    json!({ "peers_count": listed.len(), "peers": listed })
}

/// Pause or resume the PoW worker on roles that carry one.
fn mining_control(ctx: &Arc<NodeContext>, stop: bool) -> Reply {
    if !ctx.role.can_mine() {
        return Err((
            StatusCode::BAD_REQUEST,
            "this node has no mining worker".to_string(),
        ));
    }
    ctx.miner_stop.store(stop, std::sync::atomic::Ordering::SeqCst);
    let state = if stop { "stopped" } else { "started" };
    Ok(json!({ "status": "success", "mining": state }))
}
