//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions of both kinds as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/crds.yaml
//! cargo run --bin crdgen -- --kind binding | kubectl apply -f -
//! ```

use clap::{Parser, ValueEnum};
use kube::core::CustomResourceExt;
use service_manager_controller::constants::API_GROUP;
use service_manager_controller::crd::{ServiceBinding, ServiceInstance};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Instance,
    Binding,
    All,
}

#[derive(Debug, Parser)]
#[command(name = "crdgen", about = "Generate the controller's CRD manifests")]
struct Args {
    /// Which CRD to print
    #[arg(long, value_enum, default_value = "all")]
    kind: Kind,
}

fn main() {
    let args = Args::parse();
    let crds = match args.kind {
        Kind::Instance => vec![ServiceInstance::crd()],
        Kind::Binding => vec![ServiceBinding::crd()],
        Kind::All => vec![ServiceInstance::crd(), ServiceBinding::crd()],
    };

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# API group: {API_GROUP}");
    for crd in crds {
        match serde_yaml::to_string(&crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
