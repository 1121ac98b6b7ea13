use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Proto sources live at the workspace root
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let workspace_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .ok_or("crate is not inside a workspace")?;
    let proto_dir = workspace_root.join("proto");

    let proto_files = [proto_dir.join("boxrun/v1/daemon.proto")];

    for proto in &proto_files {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    // Generated code lives next to the sources in src/gen
    let gen_dir = manifest_dir.join("src/gen");
    std::fs::create_dir_all(&gen_dir)?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&gen_dir)
        .compile_protos(&proto_files, &[proto_dir])?;

    Ok(())
}
