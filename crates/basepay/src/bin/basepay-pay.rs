use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use basepay::{
    BalanceAsset, ChainConfig, InvoiceOrchestrator, InvoiceStatus, LocalKeyConnector, PaymentRequest,
    Session,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,alloy=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Ok(private_key) = std::env::var("BASEPAY_PRIVATE_KEY") else {
        eprintln!(
            "ERROR: BASEPAY_PRIVATE_KEY is required.\n\
             Set it to the hex private key of a funded Base Sepolia account."
        );
        return ExitCode::FAILURE;
    };

    let config = match ChainConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };

    let connector = match LocalKeyConnector::new(&private_key) {
        Ok(connector) => connector,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };
    drop(private_key);

    println!("Paying demo invoice on {} ({})...", config.display_name, config.chain_id_hex());
    println!("  Payer:    {}", connector.address());
    println!("  Merchant: {}", config.merchant);
    println!("  Tracker:  {}", config.invoice_tracker);
    println!(
        "  Amount:   {} {}",
        config.invoice_amount, config.token.symbol
    );

    let session = Arc::new(Session::new(connector, config.clone()));
    if let Err(e) = session.connect().await {
        eprintln!("ERROR: could not connect: {e}");
        return ExitCode::FAILURE;
    }

    let orchestrator = InvoiceOrchestrator::new(Arc::clone(&session));

    match orchestrator.refresh_balances().await {
        Ok(balances) => {
            println!("\nBalances before payment:");
            for balance in balances.iter() {
                let unit = match balance.asset {
                    BalanceAsset::Native => config.native_ticker.as_str(),
                    BalanceAsset::Token(_) => config.token.symbol.as_str(),
                };
                println!("  {}  {} {unit}", balance.address, balance.display_amount());
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not read balances before payment"),
    }

    let result = orchestrator
        .pay_invoice(&PaymentRequest::from_config(&config))
        .await;

    if let Some(invoice) = orchestrator.store().invoice() {
        println!();
        for tx in invoice.tx_refs() {
            println!("  tx: {}", config.explorer_tx_url(&tx.hash));
        }
    }
    match serde_json::to_string_pretty(&orchestrator.store().snapshot()) {
        Ok(json) => println!("\n{json}"),
        Err(e) => tracing::warn!(error = %e, "could not serialize state"),
    }

    let _ = session.disconnect().await;

    match result {
        Ok(invoice) if invoice.status == InvoiceStatus::Paid => {
            println!("\nInvoice paid.");
            ExitCode::SUCCESS
        }
        Ok(invoice) => {
            eprintln!("\nInvoice settled as {} on-chain.", invoice.status);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("\nERROR: {e}");
            ExitCode::FAILURE
        }
    }
}
