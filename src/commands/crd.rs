use anyhow::Result;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt};

use kubetemplater::crd::{KubeTemplate, KubeTemplatePolicy};

/// Print both CRDs' YAML to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    println!("{}", serde_yaml::to_string(&KubeTemplate::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&KubeTemplatePolicy::crd())?);
    Ok(())
}

/// Apply both CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    install_one(&crds, KubeTemplate::crd()).await?;
    install_one(&crds, KubeTemplatePolicy::crd()).await?;
    Ok(())
}

async fn install_one(
    crds: &Api<CustomResourceDefinition>,
    crd: CustomResourceDefinition,
) -> Result<()> {
    let name = crd.metadata.name.clone().unwrap_or_default();
    match crds.create(&Default::default(), &crd).await {
        Ok(_) => println!("CRD '{name}' installed successfully"),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            println!("CRD '{name}' already exists, skipping");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
