use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use walletlink_core::core_pairing::PairingUri;
use walletlink_core::core_relay::WsConnector;
use walletlink_core::core_rpc::{ErrorPayload, JsonRpcResponse};
use walletlink_core::core_session::{
    ApproveParams, ConnectParams, Metadata, Namespace, Namespaces, OutboundRequest,
    ProposalNamespace, ProposalNamespaces, SessionProposal,
};
use walletlink_core::core_store::MemoryStorage;
use walletlink_core::errors::codes;
use walletlink_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use walletlink_core::test_utils::{self, MemoryRelay};
use walletlink_core::{Client, ClientEvent, ClientOptions, Config};

#[derive(Parser, Debug)]
#[command(name = "walletlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML config file; environment variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the fields of a pairing URI
    ParseUri { uri: String },

    /// Dapp role: propose a session and wait for a wallet to approve it
    Connect {
        /// Chains to require, e.g. eip155:1
        #[arg(long, default_value = "eip155:1")]
        chains: Vec<String>,

        #[arg(long, default_value = "personal_sign")]
        methods: Vec<String>,

        #[arg(long, default_value = "chainChanged")]
        events: Vec<String>,

        /// Send one session_request with this method once connected
        #[arg(long)]
        request: Option<String>,

        /// JSON params for --request
        #[arg(long, default_value = "[]")]
        params: String,
    },

    /// Wallet role: pair with a URI and approve with the given accounts
    Wallet {
        uri: String,

        /// CAIP-10 accounts, e.g. eip155:1:0xab16...
        #[arg(long, required = true)]
        accounts: Vec<String>,
    },

    /// Run a dapp and a wallet against an in-process relay
    Demo,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };
    Ok(config)
}

fn cli_metadata(name: &str) -> Metadata {
    Metadata {
        name: name.to_string(),
        description: "walletlink command line".to_string(),
        url: "https://github.com/walletlink".to_string(),
        icons: vec![],
        redirect: None,
    }
}

fn proposal_namespaces(chains: &[String], methods: &[String], events: &[String]) -> Result<ProposalNamespaces> {
    let mut namespaces = ProposalNamespaces::new();
    for chain in chains {
        let Some((family, _)) = chain.split_once(':') else {
            bail!("chain {} is not a CAIP-2 id", chain);
        };
        let entry = namespaces
            .entry(family.to_string())
            .or_insert_with(|| ProposalNamespace {
                chains: Some(vec![]),
                methods: methods.to_vec(),
                events: events.to_vec(),
            });
        if let Some(list) = entry.chains.as_mut() {
            list.push(chain.clone());
        }
    }
    Ok(namespaces)
}

/// Grant everything the proposal requires, on the chains our accounts live on
fn namespaces_for(proposal: &SessionProposal, accounts: &[String]) -> Namespaces {
    let mut namespaces = Namespaces::new();
    let requested = proposal
        .required_namespaces
        .iter()
        .chain(proposal.optional_namespaces.iter());
    for (key, wanted) in requested {
        let family = key.split(':').next().unwrap_or(key).to_string();
        let accounts: Vec<String> = accounts
            .iter()
            .filter(|a| a.starts_with(&format!("{}:", family)))
            .cloned()
            .collect();
        let mut chains: Vec<String> = accounts
            .iter()
            .filter_map(|a| a.rsplit_once(':').map(|(chain, _)| chain.to_string()))
            .collect();
        chains.dedup();

        let entry = namespaces.entry(family).or_insert_with(|| Namespace {
            chains: Some(vec![]),
            accounts: vec![],
            methods: vec![],
            events: vec![],
        });
        for chain in chains {
            if let Some(list) = entry.chains.as_mut() {
                if !list.contains(&chain) {
                    list.push(chain);
                }
            }
        }
        for account in accounts {
            if !entry.accounts.contains(&account) {
                entry.accounts.push(account);
            }
        }
        for method in &wanted.methods {
            if !entry.methods.contains(method) {
                entry.methods.push(method.clone());
            }
        }
        for event in &wanted.events {
            if !entry.events.contains(event) {
                entry.events.push(event.clone());
            }
        }
    }
    namespaces
}

async fn next_proposal(events: &mut broadcast::Receiver<ClientEvent>) -> Result<SessionProposal> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::SessionProposal { proposal }) => return Ok(*proposal),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("client stopped"),
        }
    }
}

async fn run_connect(
    config: Config,
    namespaces: ProposalNamespaces,
    request: Option<(String, Value)>,
) -> Result<()> {
    let client = Client::new(
        config,
        ClientOptions::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(WsConnector),
            cli_metadata("walletlink dapp"),
        ),
    )?;
    client.init().await?;

    let connected = client
        .connect(ConnectParams {
            required_namespaces: namespaces,
            ..Default::default()
        })
        .await?;
    if let Some(uri) = &connected.uri {
        println!("{}", uri);
    }

    let session = connected.approval.await?;
    info!(topic = %session.topic, peer = %session.peer.metadata.name, "session approved");

    if let Some((method, params)) = request {
        let chain_id = session
            .namespaces
            .values()
            .filter_map(|ns| ns.chains.as_ref())
            .flatten()
            .next()
            .cloned()
            .context("session has no chains")?;
        let result = client
            .request(OutboundRequest {
                topic: session.topic.clone(),
                chain_id,
                method,
                params,
                expiry: None,
            })
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    client.disconnect(&session.topic).await?;
    client.shutdown().await;
    Ok(())
}

async fn run_wallet(config: Config, uri: String, accounts: Vec<String>) -> Result<()> {
    let client = Client::new(
        config,
        ClientOptions::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(WsConnector),
            cli_metadata("walletlink wallet"),
        ),
    )?;
    let mut events = client.events();
    client.init().await?;
    client.pair(&uri).await?;

    let proposal = next_proposal(&mut events).await?;
    info!(id = proposal.id, dapp = %proposal.proposer.metadata.name, "approving proposal");
    let approved = client
        .approve(ApproveParams {
            id: proposal.id,
            namespaces: namespaces_for(&proposal, &accounts),
            session_properties: None,
            relay_protocol: None,
        })
        .await?;
    approved.acknowledged.await?;
    println!("session {}", approved.topic);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::SessionRequest { request }) => {
                    println!("{} {} {}", request.chain_id, request.method, request.params);
                    // no signer behind the CLI
                    let reason = ErrorPayload::new(codes::USER_REJECTED, "User rejected.");
                    client
                        .respond(&request.topic, JsonRpcResponse::error(request.id, reason))
                        .await?;
                }
                Ok(ClientEvent::SessionDelete { topic, .. }) if topic == approved.topic => {
                    info!("dapp disconnected");
                    break;
                }
                Ok(event) => info!(event = event.name(), "event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn run_demo() -> Result<()> {
    let relay = MemoryRelay::new();
    let start = |metadata: Metadata| -> Result<Client> {
        Ok(Client::new(
            Config::default(),
            ClientOptions::new(
                Arc::new(MemoryStorage::new()),
                Arc::new(relay.connector()),
                metadata,
            ),
        )?)
    };
    let dapp = start(test_utils::dapp_metadata())?;
    let wallet = start(test_utils::wallet_metadata())?;
    let mut wallet_events = wallet.events();
    dapp.init().await?;
    wallet.init().await?;

    let connected = dapp
        .connect(ConnectParams {
            required_namespaces: test_utils::required_namespaces(),
            ..Default::default()
        })
        .await?;
    let uri = connected.uri.clone().context("new pairing without uri")?;
    info!(%uri, "pairing uri");
    wallet.pair(&uri).await?;

    let proposal = next_proposal(&mut wallet_events).await?;
    let approved = wallet
        .approve(ApproveParams {
            id: proposal.id,
            namespaces: test_utils::approved_namespaces(),
            session_properties: None,
            relay_protocol: None,
        })
        .await?;
    let session = connected.approval.await?;
    approved.acknowledged.await?;
    info!(topic = %session.topic, "session settled");

    let request = dapp.request(OutboundRequest {
        topic: session.topic.clone(),
        chain_id: "eip155:1".to_string(),
        method: "personal_sign".to_string(),
        params: json!(["0x68656c6c6f", test_utils::TEST_ACCOUNT]),
        expiry: None,
    });
    let answer = async {
        loop {
            match wallet_events.recv().await {
                Ok(ClientEvent::SessionRequest { request }) => {
                    let response = JsonRpcResponse::result(request.id, json!("0xdemo-signature"));
                    return wallet.respond(&request.topic, response).await;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(walletlink_core::EngineError::Internal("wallet stopped".into()));
                }
            }
        }
    };
    let (result, answered) = tokio::join!(request, answer);
    answered?;
    println!("personal_sign -> {}", result?);

    dapp.disconnect(&session.topic).await?;
    dapp.shutdown().await;
    wallet.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level: LogLevel = args.log_level.parse().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', using 'info'", args.log_level);
        LogLevel::Info
    });
    init_logging_with_config(LogConfig::new(log_level).json_format(args.json_logs))?;

    match args.command {
        Command::ParseUri { uri } => {
            let parsed: PairingUri = uri.parse()?;
            println!("topic:     {}", parsed.topic);
            println!("version:   {}", parsed.version);
            println!("relay:     {}", parsed.relay.protocol);
            println!("expires:   {}", parsed.expiry_timestamp);
            if !parsed.methods.is_empty() {
                println!("methods:   {}", parsed.methods.join(","));
            }
        }
        Command::Connect {
            chains,
            methods,
            events,
            request,
            params,
        } => {
            let config = load_config(args.config.as_ref())?;
            let namespaces = proposal_namespaces(&chains, &methods, &events)?;
            let request = match request {
                Some(method) => {
                    let params: Value =
                        serde_json::from_str(&params).context("--params is not JSON")?;
                    Some((method, params))
                }
                None => None,
            };
            run_connect(config, namespaces, request).await?;
        }
        Command::Wallet { uri, accounts } => {
            let config = load_config(args.config.as_ref())?;
            run_wallet(config, uri, accounts).await?;
        }
        Command::Demo => run_demo().await?,
    }

    Ok(())
}
