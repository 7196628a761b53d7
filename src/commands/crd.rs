use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt, ResourceExt};

use kube_appwrapper::crd::{AppWrapper, QuotaPool};

use crate::cli::CrdAction;

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![AppWrapper::crd(), QuotaPool::crd()]
}

pub async fn run(action: CrdAction) -> Result<()> {
    match action {
        CrdAction::Generate => {
            for crd in all_crds() {
                println!("---");
                print!(
                    "{}",
                    serde_yaml::to_string(&crd).context("Failed to serialize CRD")?
                );
            }
            Ok(())
        }
        CrdAction::Install => install().await,
    }
}

async fn install() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<CustomResourceDefinition> = Api::all(client);

    for crd in all_crds() {
        let name = crd.name_any();
        api.patch(
            &name,
            &PatchParams::apply("kube-appwrapper-operator").force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("Failed to install CRD {name}"))?;
        println!("Installed {name}");
    }

    Ok(())
}
