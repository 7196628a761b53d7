use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;

use kube_appwrapper::crd::AppWrapper;

pub async fn run() -> Result<()> {
    println!("Checking cluster connectivity...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Node access ................. ");
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} visible)", list.items.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  AppWrapper CRD .............. ");
    let wrappers: Api<AppWrapper> = Api::all(client);
    match wrappers.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("NOT INSTALLED");
            anyhow::bail!(
                "AppWrapper CRD is not installed: {}. Run `kube-appwrapper crd install` first.",
                e
            );
        }
    }

    println!("\nAll checks passed.");
    Ok(())
}
