use consul_config_operator::crd::all_crds;

fn main() -> anyhow::Result<()> {
    for crd in all_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
