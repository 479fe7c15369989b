fn main() {
    voxen::main();
}
