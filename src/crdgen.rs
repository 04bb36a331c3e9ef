//! # CRD Generator
//!
//! Prints the GitJob CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/gitjob.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use gitjob_controller::crd::GitJob;
use kube::core::CustomResourceExt;

fn main() {
    let crd = GitJob::crd();

    match serde_yaml::to_string(&crd) {
        Ok(yaml) => {
            print!("{}", yaml);
        }
        Err(e) => {
            eprintln!("Failed to serialize CRD to YAML: {}", e);
            std::process::exit(1);
        }
    }
}
