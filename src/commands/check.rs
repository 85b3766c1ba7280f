use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ListParams;
use kube::{Api, Client, CustomResourceExt};

use kubetemplater::crd::{KubeTemplate, KubeTemplatePolicy};

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {e}");
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    print!("  KubeTemplate CRD installed ... ");
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crds.get(&KubeTemplate::crd_name()).await {
        Ok(_) => println!("OK"),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            println!("MISSING (run `kubetemplater-operator crd install`)")
        }
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  KubeTemplatePolicy CRD ....... ");
    match crds.get(&KubeTemplatePolicy::crd_name()).await {
        Ok(_) => println!("OK"),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            println!("MISSING (run `kubetemplater-operator crd install`)")
        }
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  List KubeTemplate permission . ");
    let templates: Api<KubeTemplate> = Api::all(client.clone());
    match templates.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
