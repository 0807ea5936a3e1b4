use eni_cni::commands::run_ipam;

fn main() {
    if let Err(failure) = run_ipam() {
        let _ = failure.error_result().print();
        std::process::exit(1);
    }
}
