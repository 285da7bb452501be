//! twinlink - demo client for the twin registry
//!
//! Connects with the configured credentials, runs one command and destroys
//! the client with a grace period.

use std::time::Duration;

use twinlink_client::{IntegrationClient, Things};
use twinlink_utils::{init_logging_with_config, LogConfig, Result};

mod cli;

use cli::{error_hint, parse_value, Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    init_logging_with_config(LogConfig::cli())?;
    tracing::debug!("CLI args: {:?}", args.command);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("twinlink error: {}", e);
            eprintln!("Error: {}", e);
            if let Some(hint) = error_hint(&e) {
                eprintln!("{}", hint);
            }
            Err(e)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.client_config()?;
    let grace = args
        .grace
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.shutdown_grace());

    let client = IntegrationClient::create(config).await?;
    let result = run_command(&client, args.command).await;
    client.destroy(grace).await;
    result
}

async fn run_command(client: &IntegrationClient, command: Command) -> Result<()> {
    let things = client.things();

    match command {
        Command::Watch { thing, path } => watch(client, thing, path).await,
        Command::Create { thing_id } => {
            let created = match thing_id {
                Some(id) => things.create_with_id(id).await?,
                None => things.create().await?,
            };
            print_json(&created);
            Ok(())
        }
        Command::Get { thing_id } => {
            print_json(&things.retrieve(thing_id).await?);
            Ok(())
        }
        Command::Delete { thing_id } => {
            things.delete(thing_id.clone()).await?;
            println!("Deleted {}", thing_id);
            Ok(())
        }
        Command::SetAttr {
            thing_id,
            path,
            value,
        } => {
            things
                .for_id(thing_id)
                .change_attribute(path.as_str(), parse_value(&value))
                .await?;
            println!("Set {}", path);
            Ok(())
        }
        Command::Demo { thing_id } => demo(client, &things, &thing_id).await,
    }
}

async fn watch(client: &IntegrationClient, thing: Option<String>, path: Option<String>) -> Result<()> {
    let scope = thing.map(|id| client.for_thing(id));

    match &scope {
        Some(handle) => handle.register_for_lifecycle_event("watch_lifecycle", |event| {
            println!("lifecycle {:?} {} (rev {})", event.action, event.thing_id, event.revision);
        })?,
        None => client.register_for_thing_lifecycle_event("watch_lifecycle", |event| {
            println!("lifecycle {:?} {} (rev {})", event.action, event.thing_id, event.revision);
        })?,
    }

    let print_change = |change: twinlink_protocol::AttributeChange| match change.value {
        Some(value) => println!("attribute {} {} = {}", change.thing_id, change.path, value),
        None => println!("attribute {} {} removed", change.thing_id, change.path),
    };
    match (&scope, path) {
        (Some(handle), Some(path)) => {
            handle.register_for_attribute_path_change("watch_attributes", path, print_change)?
        }
        (Some(handle), None) => handle.register_for_attribute_change("watch_attributes", print_change)?,
        (None, Some(path)) => {
            client.register_for_thing_attribute_path_change("watch_attributes", path, print_change)?
        }
        (None, None) => client.register_for_thing_attribute_change("watch_attributes", print_change)?,
    }

    tracing::info!("Watching for events, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Walk through registration, CRUD and deregistration against one Thing
async fn demo(client: &IntegrationClient, things: &Things, thing_id: &str) -> Result<()> {
    let all_lifecycle = "allThings_lifecycleRegistration";
    client.register_for_thing_lifecycle_event(all_lifecycle, |lifecycle| {
        tracing::info!(?lifecycle, "lifecycle received");
    })?;
    client.register_for_thing_attribute_change("allThings_attributeChangeRegistration", |change| {
        tracing::info!(?change, "attributeChange received");
    })?;
    client.register_for_thing_attribute_path_change(
        "allThings_specificAttributeChangeRegistration",
        "address/city",
        |change| tracing::info!(?change, "attributeChange received"),
    )?;

    let created = things
        .create_with_id(thing_id)
        .on_success(|thing| tracing::info!(%thing, "Thing created"))
        .on_failure(|err| tracing::error!(error = %err, "Create Thing failed"))
        .apply()?;

    client.deregister(all_lifecycle);

    let my_thing = client.for_thing(thing_id);
    let my_lifecycle = "myThing_lifecycleRegistration";
    my_thing.register_for_lifecycle_event(my_lifecycle, |event| {
        tracing::info!(?event, "lifecycle received");
    })?;
    my_thing.register_for_attribute_change("myThing_attributeChangeRegistration", |change| {
        tracing::info!(?change, "attributeChange received");
    })?;
    my_thing.register_for_attribute_path_change(
        "myThing_specificAttributeChangeRegistration",
        "address/city",
        |change| tracing::info!(?change, "attributeChange received"),
    )?;

    // Attribute changes need the Thing to exist
    if let Err(e) = created.await {
        tracing::warn!(error = %e, "Continuing without a freshly created Thing");
    }

    my_thing
        .change_attribute("address/city", "Berlin")
        .on_success(|_| tracing::info!("New attribute created successfully"))
        .on_failure(|err| {
            tracing::error!(error = %err, retryable = err.is_retryable(), "Failed to create new attribute")
        })
        .apply()?;

    my_thing.deregister(my_lifecycle);
    my_thing.delete().apply()?;
    Ok(())
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
