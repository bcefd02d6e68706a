use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: switchyard-gateway <config.json> [--listen HOST:PORT] [--db PATH]")?;

    let mut listen_override: Option<String> = None;
    let mut db_override: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--db" => {
                db_override = Some(args.next().ok_or("missing value for --db")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let mut config = switchyard::GatewayConfig::from_file(&path)?;
    if let Some(listen) = listen_override {
        config.listen = listen;
    }
    if let Some(db) = db_override {
        config.storage.path = db.into();
    }

    switchyard::observability::init(config.json_logs);

    let listen = config.listen.clone();
    let gateway = Arc::new(switchyard::Gateway::new(config).await?);
    gateway.start().await?;

    let app = switchyard::http::router(Arc::clone(&gateway));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "switchyard-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
