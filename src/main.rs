use std::process::ExitCode;

use cellcount::cli;

#[rocket::main]
async fn main() -> ExitCode {
    // 参数不对：打印用法后直接退出，不加载模型
    let args = match cli::parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            println!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match cellcount::rocket_with_port(args.port).launch().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cellcount failed to start: {e}");
            ExitCode::FAILURE
        }
    }
}
