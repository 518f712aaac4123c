fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/controller.capnp")
        .default_parent_module(vec!["rpc".to_owned()])
        .run()
        .expect("compiled controller");
}
