use std::fs;
use std::io::{self, Write};

use clap::Parser;
use oracledb::client::Client;
use oracledb::codec::PayloadCodec;
use oracledb::model::{MetaEntry, Record};
use oracledb::parser::{self, Command};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Interactive shell for oracledb", long_about = None)]
struct Args {
    #[clap(long, env = "ORACLEDB_ADDR", default_value = "127.0.0.1:9000")]
    addr: String,
}

fn main() {
    let args = Args::parse();
    print_banner();

    let mut client = match Client::connect(&args.addr) {
        Ok(client) => {
            println!("[\u{2713}] Connected to oracledb at {}!", args.addr);
            client
        }
        Err(_) => {
            println!("[\u{2717}] Could not connect to server at {}.", args.addr);
            println!("    Make sure to run 'cargo run --release --bin oracledb' in another terminal.");
            return;
        }
    };
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("oracledb> ");
        if io::stdout().flush().is_err() { break; }
        buffer.clear();

        match stdin.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&mut client, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.contains("...") {
                    println!("    \u{2139}\u{fe0f}  Hint: Ellipses (...) are not supported. Please close the list: [0.1, 0.5]");
                } else if buffer.to_uppercase().starts_with("RUN") {
                    println!("    \u{2139}\u{fe0f}  Hint: Try 'RUN 1 (\"12\", \"0.9\")'");
                }
            }
        }
    }
}

fn print_banner() {
    println!("\n==================================================");
    println!("   oracledb CLI v{} - Vectors + Oracles", env!("CARGO_PKG_VERSION"));
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!(" 1. CREATE:   CREATE RECORD [0.1, ...] META name=\"value\", ...");
    println!(" 2. READ:     READ RECORD 7   (or GET 7)");
    println!(" 3. UPDATE:   UPDATE RECORD 7 [0.2, ...] META name=\"value\"");
    println!(" 4. DELETE:   DELETE RECORD 7");
    println!(" 5. LIST:     LIST RECORDS PAGE 1 PER 20");
    println!(" 6. BATCH:    CREATE RECORDS [0.1, ...] META name=\"value\"; [0.2, ...]");
    println!(" 7. DROP:     DELETE RECORDS 7, 8, 9");
    println!(" 8. SEARCH:   FIND RECORDS name=\"value\"");
    println!(" 9. REGISTER: CREATE ORACLE findSimilar FROM \"oracle.wat\"");
    println!("10. FIND:     FIND ORACLE findSimilar");
    println!("11. SHOW:     READ ORACLE 1");
    println!("12. ORACLES:  LIST ORACLES PAGE 1 PER 20");
    println!("13. RUN:      RUN 1 (\"arg\", ...)");
    println!("14. INFO:     Server status");
    println!("15. EXIT:     Quit\n");
}

fn execute_command(client: &mut Client, cmd: Command) -> Result<(), String> {
    match cmd {
        Command::Help => { print_help(); Ok(()) },
        Command::Exit => Ok(()),

        Command::CreateRecord { data, meta } => {
            let res = client.create_record(data, meta).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("[\u{2713} OK] Created record {}", res.msg);
            Ok(())
        }
        Command::ReadRecord { id } => {
            let res = client.read_record(id).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            if let Some(record) = res.record {
                print_record(&record);
            }
            Ok(())
        }
        Command::UpdateRecord { id, data, meta } => {
            let res = client.update_record(id, data, meta).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("[\u{2713} OK] Updated record {}", id);
            Ok(())
        }
        Command::DeleteRecord { id } => {
            let res = client.delete_record(id).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("[\u{2713} OK] Deleted record {}", id);
            Ok(())
        }
        Command::ListRecords { page, per_page } => {
            let res = client.list_records(page, per_page).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            if let Some(p) = res.page {
                println!("\n{} records, page {}/{}:", p.total, page.max(1), p.pages);
                for record in &p.items {
                    print_record(record);
                }
                println!();
            }
            Ok(())
        }
        Command::CreateRecords { records } => {
            let res = client.create_records(records).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            let ids: Vec<String> = res.ids.iter().map(|id| id.to_string()).collect();
            println!("[\u{2713} OK] Created {} records: {}", res.ids.len(), ids.join(", "));
            Ok(())
        }
        Command::DeleteRecords { ids } => {
            let requested = ids.len();
            let res = client.delete_records(ids).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("[\u{2713} OK] Deleted {} of {} records", res.msg, requested);
            Ok(())
        }
        Command::FindRecords { name, value } => {
            let res = client.find_records(&name, &value).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("\n{} records with {}=\"{}\":", res.records.len(), name, value);
            for record in &res.records {
                print_record(record);
            }
            println!();
            Ok(())
        }

        Command::CreateOracle { name, path } => {
            let code = fs::read_to_string(&path).map_err(|e| format!("Cannot read {}: {}", path, e))?;
            let res = client.create_oracle(&name, &code).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("[\u{2713} OK] Oracle '{}' has id {}", name, res.msg);
            Ok(())
        }
        Command::FindOracle { name } => {
            let res = client.find_oracle(&name).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            match res.oracles.first() {
                Some(o) => println!("  \u{2022} {} -> id {}", o.name, o.id),
                None => println!("[\u{2717}] No oracle named '{}'.", name),
            }
            Ok(())
        }
        Command::ReadOracle { id } => {
            let res = client.read_oracle(id).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            if let Some(o) = res.oracle {
                println!("Oracle {} '{}' ({} bytes of code):\n{}", o.id, o.name, o.code.len(), o.code);
            }
            Ok(())
        }
        Command::ListOracles { page, per_page } => {
            let res = client.list_oracles(page, per_page).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            println!("\n{} oracles, page {}/{}:", res.total, page.max(1), res.pages);
            for o in &res.oracles {
                println!("  \u{2022} {} -> id {}", o.name, o.id);
            }
            println!();
            Ok(())
        }
        Command::Run { id, args } => {
            let res = client.run(id, args).map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            if let Some(result) = res.result {
                let bytes = PayloadCodec::decode(&result).map_err(|e| e.to_string())?;
                let note = if result.compressed { " (compressed on the wire)" } else { "" };
                println!("Result{}:\n{}", note, String::from_utf8_lossy(&bytes));
            }
            Ok(())
        }
        Command::Info => {
            let res = client.info().map_err(|e| e.to_string())?;
            check(res.success, &res.msg)?;
            if let Some(info) = res.info {
                println!("oracledb v{} | pid {} | {}/{} | {} cpus | up {}s", info.version, info.pid, info.os, info.arch, info.cpus, info.uptime_secs);
                println!("records: {} | oracles: {}", info.records, info.oracles);
                let e = info.engine;
                println!("runs: {} started, {} running, {} ok, {} failed, {} timed out, {} cancelled",
                         e.started, e.running, e.succeeded, e.failed, e.timed_out, e.cancelled);
            }
            Ok(())
        }
    }
}

fn check(success: bool, msg: &str) -> Result<(), String> {
    if success { Ok(()) } else { Err(msg.to_string()) }
}

fn print_record(record: &Record) {
    let meta: Vec<String> = record.meta.iter().map(|MetaEntry { name, value }| format!("{}=\"{}\"", name, value)).collect();
    println!("  \u{2022} {} {:?} {}", record.id, record.data, meta.join(", "));
}
