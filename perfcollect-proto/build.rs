fn main() {
    let fd = protox::compile(["src/protos/collector.proto"], ["src/protos"])
        .expect("compile collector.proto");
    prost_build::compile_fds(fd).expect("build file descriptors");
}
