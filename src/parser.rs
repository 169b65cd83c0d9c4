use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1, one_of},
    combinator::{map, map_res, opt, recognize},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::model::MetaEntry;

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    CreateRecord { data: Vec<f64>, meta: Vec<MetaEntry> },
    ReadRecord { id: u64 },
    UpdateRecord { id: u64, data: Option<Vec<f64>>, meta: Option<Vec<MetaEntry>> },
    DeleteRecord { id: u64 },
    ListRecords { page: u64, per_page: u64 },
    CreateRecords { records: Vec<(Vec<f64>, Vec<MetaEntry>)> },
    DeleteRecords { ids: Vec<u64> },
    FindRecords { name: String, value: String },
    CreateOracle { name: String, path: String },
    FindOracle { name: String },
    ReadOracle { id: u64 },
    ListOracles { page: u64, per_page: u64 },
    Run { id: u64, args: Vec<String> },
    Info,
    Help,
    Exit,
}

const DEFAULT_PER_PAGE: u64 = 20;

// --- BASIC PARSERS ---

fn parse_float(input: &str) -> IResult<&str, f64> {
    let (input, num_str) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(tuple((char('.'), digit1))),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;
    match num_str.parse::<f64>() {
        Ok(n) => Ok((input, n)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
    }
}

fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn parse_vector(input: &str) -> IResult<&str, Vec<f64>> {
    delimited(
        ws(char('[')),
        separated_list1(tuple((multispace0, char(','), multispace0)), parse_float),
        ws(char(']')),
    )(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

fn parse_name(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.'),
        |s: &str| s.to_string(),
    )(input)
}

/// `META name="value", other="value"`
fn parse_meta(input: &str) -> IResult<&str, Vec<MetaEntry>> {
    preceded(ws(tag_ci("META")), separated_list1(ws(char(',')), parse_meta_entry))(input)
}

fn parse_meta_entry(input: &str) -> IResult<&str, MetaEntry> {
    map(
        tuple((parse_name, ws(char('=')), parse_quoted_string)),
        |(name, _, value)| MetaEntry { name, value },
    )(input)
}

/// `PAGE n PER m`, both optional.
fn parse_paging(input: &str) -> IResult<&str, (u64, u64)> {
    let (input, page) = opt(preceded(ws(tag_ci("PAGE")), parse_u64))(input)?;
    let (input, per_page) = opt(preceded(ws(tag_ci("PER")), parse_u64))(input)?;
    Ok((input, (page.unwrap_or(1), per_page.unwrap_or(DEFAULT_PER_PAGE))))
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

fn keywords<'a>(first: &'static str, second: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    map(tuple((tag_ci(first), multispace1, tag_ci(second))), |_| ())
}

// --- COMMAND PARSERS ---

fn parse_create_record(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("CREATE", "RECORD")(input)?;
    let (input, data) = parse_vector(input)?;
    let (input, meta) = opt(parse_meta)(input)?;
    Ok((input, Command::CreateRecord { data, meta: meta.unwrap_or_default() }))
}

fn parse_read_record(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((keywords("READ", "RECORD"), map(tag_ci("GET"), |_| ())))(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    Ok((input, Command::ReadRecord { id }))
}

fn parse_update_record(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("UPDATE", "RECORD")(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    let (input, data) = opt(parse_vector)(input)?;
    let (input, meta) = opt(parse_meta)(input)?;
    Ok((input, Command::UpdateRecord { id, data, meta }))
}

fn parse_delete_record(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("DELETE", "RECORD")(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    Ok((input, Command::DeleteRecord { id }))
}

fn parse_list_records(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("LIST")(input)?;
    let (input, _) = preceded(multispace1, alt((tag_ci("RECORDS"), tag_ci("RECORD"))))(input)?;
    let (input, (page, per_page)) = parse_paging(input)?;
    Ok((input, Command::ListRecords { page, per_page }))
}

/// `CREATE RECORDS [..] META k="v"; [..]`
fn parse_create_records(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("CREATE", "RECORDS")(input)?;
    let entry = tuple((parse_vector, map(opt(parse_meta), Option::unwrap_or_default)));
    let (input, records) = separated_list1(ws(char(';')), entry)(input)?;
    Ok((input, Command::CreateRecords { records }))
}

fn parse_delete_records(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("DELETE", "RECORDS")(input)?;
    let (input, ids) = preceded(multispace1, separated_list1(ws(char(',')), parse_u64))(input)?;
    Ok((input, Command::DeleteRecords { ids }))
}

/// `FIND RECORDS name="value"`
fn parse_find_records(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("FIND")(input)?;
    let (input, _) = preceded(multispace1, alt((tag_ci("RECORDS"), tag_ci("RECORD"))))(input)?;
    let (input, MetaEntry { name, value }) = preceded(multispace1, parse_meta_entry)(input)?;
    Ok((input, Command::FindRecords { name, value }))
}

fn parse_create_oracle(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("CREATE", "ORACLE")(input)?;
    let (input, name) = preceded(multispace1, parse_name)(input)?;
    let (input, _) = ws(tag_ci("FROM"))(input)?;
    let (input, path) = parse_quoted_string(input)?;
    Ok((input, Command::CreateOracle { name, path }))
}

fn parse_find_oracle(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("FIND", "ORACLE")(input)?;
    let (input, name) = preceded(multispace1, parse_name)(input)?;
    Ok((input, Command::FindOracle { name }))
}

fn parse_read_oracle(input: &str) -> IResult<&str, Command> {
    let (input, _) = keywords("READ", "ORACLE")(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    Ok((input, Command::ReadOracle { id }))
}

fn parse_list_oracles(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("LIST")(input)?;
    let (input, _) = preceded(multispace1, alt((tag_ci("ORACLES"), tag_ci("ORACLE"))))(input)?;
    let (input, (page, per_page)) = parse_paging(input)?;
    Ok((input, Command::ListOracles { page, per_page }))
}

/// `RUN id ("a", "b")`; the argument list is optional.
fn parse_run(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("RUN")(input)?;
    let (input, id) = preceded(multispace1, parse_u64)(input)?;
    let (input, args) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_quoted_string),
        ws(char(')')),
    ))(input)?;
    Ok((input, Command::Run { id, args: args.unwrap_or_default() }))
}

fn parse_info(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("INFO")(input)?;
    Ok((input, Command::Info))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HELP")(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_create_records,
        parse_create_record,
        parse_read_record,
        parse_update_record,
        parse_delete_records,
        parse_delete_record,
        parse_list_records,
        parse_find_records,
        parse_create_oracle,
        parse_find_oracle,
        parse_read_oracle,
        parse_list_oracles,
        parse_run,
        parse_info,
        parse_help,
        parse_exit,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            // e.input contains the slice where parsing failed
            let context: String = if e.input.chars().count() > 20 {
                format!("{}...", e.input.chars().take(20).collect::<String>())
            } else {
                e.input.to_string()
            };
            Err(format!("Invalid syntax near: '{}'", context))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_record_with_meta() {
        let cmd = parse_command(r#"create record [1, -0.5, 2.5e-1] META lang="en", src="wiki""#).unwrap();
        assert_eq!(
            cmd,
            Command::CreateRecord {
                data: vec![1.0, -0.5, 0.25],
                meta: vec![MetaEntry::new("lang", "en"), MetaEntry::new("src", "wiki")],
            }
        );
        assert_eq!(
            parse_command("CREATE RECORD [0.1,0.2]").unwrap(),
            Command::CreateRecord { data: vec![0.1, 0.2], meta: vec![] }
        );
    }

    #[test]
    fn record_commands() {
        assert_eq!(parse_command("GET 7").unwrap(), Command::ReadRecord { id: 7 });
        assert_eq!(parse_command("read record 7").unwrap(), Command::ReadRecord { id: 7 });
        assert_eq!(parse_command("DELETE RECORD 3").unwrap(), Command::DeleteRecord { id: 3 });
        assert_eq!(
            parse_command(r#"UPDATE RECORD 3 META tag="x""#).unwrap(),
            Command::UpdateRecord { id: 3, data: None, meta: Some(vec![MetaEntry::new("tag", "x")]) }
        );
        assert_eq!(
            parse_command("LIST RECORDS PAGE 2 PER 5").unwrap(),
            Command::ListRecords { page: 2, per_page: 5 }
        );
        assert_eq!(
            parse_command("list records").unwrap(),
            Command::ListRecords { page: 1, per_page: DEFAULT_PER_PAGE }
        );
    }

    #[test]
    fn batch_and_find_commands() {
        assert_eq!(
            parse_command(r#"CREATE RECORDS [1, 2] META lang="en"; [3]"#).unwrap(),
            Command::CreateRecords {
                records: vec![(vec![1.0, 2.0], vec![MetaEntry::new("lang", "en")]), (vec![3.0], vec![])],
            }
        );
        assert_eq!(parse_command("delete records 4, 5,6").unwrap(), Command::DeleteRecords { ids: vec![4, 5, 6] });
        assert_eq!(
            parse_command(r#"FIND RECORDS lang = "en""#).unwrap(),
            Command::FindRecords { name: "lang".into(), value: "en".into() }
        );
        // singular forms still mean the single-record commands
        assert_eq!(parse_command("DELETE RECORD 4").unwrap(), Command::DeleteRecord { id: 4 });
        assert!(parse_command("FIND RECORDS lang").is_err());
    }

    #[test]
    fn oracle_commands() {
        assert_eq!(
            parse_command(r#"CREATE ORACLE findSimilar FROM "demos/oracles/find_similar.wat""#).unwrap(),
            Command::CreateOracle { name: "findSimilar".into(), path: "demos/oracles/find_similar.wat".into() }
        );
        assert_eq!(parse_command("FIND ORACLE findSimilar").unwrap(), Command::FindOracle { name: "findSimilar".into() });
        assert_eq!(parse_command("READ ORACLE 1").unwrap(), Command::ReadOracle { id: 1 });
        assert_eq!(
            parse_command(r#"RUN 1 ("12", "0.9")"#).unwrap(),
            Command::Run { id: 1, args: vec!["12".into(), "0.9".into()] }
        );
        assert_eq!(parse_command("RUN 4").unwrap(), Command::Run { id: 4, args: vec![] });
        assert_eq!(parse_command("run 4 ()").unwrap(), Command::Run { id: 4, args: vec![] });
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_command("CREATE RECORD [1, 2").is_err());
        assert!(parse_command("GET abc").is_err());
        assert!(parse_command("INFO please").unwrap_err().starts_with("Unexpected tokens"));
    }
}
