use kube::CustomResourceExt;
use std::fs;
use vpsie_types::*;

fn main() {
    fs::create_dir_all("../crds").unwrap();
    fs::write(
        "../crds/autoscaler.vpsie.io_nodegroup_crd.yaml",
        serde_yaml::to_string(&NodeGroup::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/autoscaler.vpsie.io_vpsnode_crd.yaml",
        serde_yaml::to_string(&VPSNode::crd()).unwrap(),
    )
    .unwrap();
}
