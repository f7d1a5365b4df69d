use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::ledger::{PlatformSummary, Wallet};
use crate::model::{Command, Location, Owner, RideId, RideRequest, RideStatus, Role, UserId};

/// Errors that can occur when reading a command script
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot open script: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    Missing {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: {kind} amount {value} is not a representable amount")]
    InvalidAmount {
        line: usize,
        kind: String,
        value: f64,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    actor: Option<UserId>,
    r#ref: Option<u64>,
    amount: Option<f64>,
    lat: Option<f64>,
    lng: Option<f64>,
    dest_lat: Option<f64>,
    dest_lng: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    owner: String,
    kind: &'static str,
    balance: String,
    earned: String,
    withdrawn: String,
}

/// Read commands from a csv script. Lines starting with `#` are comments.
///
/// The returned iterator owns the reader and borrows nothing from the caller.
pub fn read_script(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)
        .map_err(CsvError::Open)?;
    let headers = reader.headers().map_err(CsvError::Open)?.clone();

    Ok(reader.into_records().map(move |result| {
        let record = result.map_err(|source| CsvError::Parse {
            line: line_of(source.position()),
            source,
        })?;
        let line = line_of(record.position());
        let row: InputRow = record
            .deserialize(Some(&headers))
            .map_err(|source| CsvError::Parse { line, source })?;
        row.into_command(line)
    }))
}

/// 1-indexed line in the script, comments and header included.
fn line_of(position: Option<&csv::Position>) -> usize {
    position.map_or(0, |p| p.line() as usize)
}

impl InputRow {
    fn into_command(self, line: usize) -> Result<Command, CsvError> {
        let missing = |field| CsvError::Missing {
            line,
            kind: self.r#type.clone(),
            field,
        };
        let actor = || -> Result<UserId, CsvError> { self.actor.ok_or_else(|| missing("actor")) };
        let ride = || -> Result<RideId, CsvError> { self.r#ref.ok_or_else(|| missing("ref")) };
        let amount = || -> Result<Amount, CsvError> {
            let value = self.amount.ok_or_else(|| missing("amount"))?;
            Amount::try_from_float(value).ok_or_else(|| CsvError::InvalidAmount {
                line,
                kind: self.r#type.clone(),
                value,
            })
        };
        let advance = |status| -> Result<Command, CsvError> {
            Ok(Command::Advance {
                ride: ride()?,
                driver: actor()?,
                status,
            })
        };

        match self.r#type.as_str() {
            "driver" => Ok(Command::Connect {
                user: actor()?,
                role: Role::Driver,
            }),
            "customer" => Ok(Command::Connect {
                user: actor()?,
                role: Role::Customer,
            }),
            "topup" => Ok(Command::TopUp {
                customer: actor()?,
                amount: amount()?,
            }),
            "request" => {
                let point = |lat: Option<f64>, lng: Option<f64>, field| {
                    let (lat, lng) = lat.zip(lng).ok_or_else(|| missing(field))?;
                    Ok::<_, CsvError>(Location::new(lat, lng, format!("{lat:.5},{lng:.5}")))
                };
                let pickup = point(self.lat, self.lng, "pickup")?;
                let dropoff = point(self.dest_lat, self.dest_lng, "dropoff")?;
                Ok(Command::RequestRide(RideRequest::new(
                    actor()?,
                    pickup,
                    dropoff,
                )))
            }
            "accept" => Ok(Command::Accept {
                ride: ride()?,
                driver: actor()?,
            }),
            "arrive" => advance(RideStatus::OnTheWay),
            "start" => advance(RideStatus::InProgress),
            "complete" => advance(RideStatus::Completed),
            "cancel" => Ok(Command::Cancel {
                ride: ride()?,
                reason: match self.actor {
                    Some(actor) => format!("cancelled by user {actor}"),
                    None => "cancelled".to_string(),
                },
            }),
            "withdraw" => {
                let driver = actor()?;
                Ok(Command::RequestWithdrawal {
                    driver,
                    amount: amount()?,
                    destination: format!("driver-{driver}"),
                })
            }
            "approve" => Ok(Command::ApproveWithdrawal { txn: ride()? }),
            "reject" => Ok(Command::RejectWithdrawal { txn: ride()? }),
            other => Err(CsvError::UnrecognizedType {
                line,
                kind: other.to_string(),
            }),
        }
    }
}

/// Write wallets, then one platform row, in csv format
pub fn write_wallets(
    writer: impl io::Write,
    wallets: impl IntoIterator<Item = Wallet>,
    platform: PlatformSummary,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut wallets: Vec<Wallet> = wallets.into_iter().collect();
    wallets.sort_by_key(|w| match w.owner {
        Owner::Customer(id) => (0, id),
        Owner::Driver(id) => (1, id),
        Owner::Platform => (2, 0),
    });

    for wallet in wallets {
        let (owner, kind) = match wallet.owner {
            Owner::Customer(id) => (id.to_string(), "customer"),
            Owner::Driver(id) => (id.to_string(), "driver"),
            Owner::Platform => ("platform".to_string(), "platform"),
        };
        writer.serialize(OutputRow {
            owner,
            kind,
            balance: wallet.balance.to_string(),
            earned: wallet.total_earned.to_string(),
            withdrawn: wallet.total_withdrawn.to_string(),
        })?;
    }

    writer.serialize(OutputRow {
        owner: "platform".to_string(),
        kind: "platform",
        balance: platform.total_admin_earnings.to_string(),
        earned: platform.total_admin_earnings.to_string(),
        withdrawn: Amount::ZERO.to_string(),
    })?;

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "type,actor,ref,amount,lat,lng,dest_lat,dest_lng\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(rows);
        read_script(file.path()).unwrap().collect()
    }

    #[test]
    fn read_top_up() {
        let results = read("topup,1,,10.5,,,,\n");
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            Command::TopUp { customer, amount } => {
                assert_eq!(customer, 1);
                assert_eq!(amount, Amount::from_float(10.5));
            }
            other => panic!("expected top-up, got {other:?}"),
        }
    }

    #[test]
    fn read_request() {
        let results = read("request,1,,,43.65,-79.38,43.70,-79.40\n");

        match results.into_iter().next().unwrap().unwrap() {
            Command::RequestRide(request) => {
                assert_eq!(request.customer, 1);
                assert_eq!(request.pickup.lat, 43.65);
                assert_eq!(request.dropoff.lng, -79.40);
                assert!(request.pickup.is_valid());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn read_status_changes() {
        let results = read("arrive,9,3,,,,,\nstart,9,3,,,,,\ncomplete,9,3,,,,,\n");
        let statuses: Vec<_> = results
            .into_iter()
            .map(|r| match r.unwrap() {
                Command::Advance {
                    ride: 3,
                    driver: 9,
                    status,
                } => status,
                other => panic!("expected advance, got {other:?}"),
            })
            .collect();
        assert_eq!(
            statuses,
            [RideStatus::OnTheWay, RideStatus::InProgress, RideStatus::Completed]
        );
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("driver, 9, , , , , , \n");
        let results: Vec<_> = read_script(file.path()).unwrap().collect();
        assert!(matches!(
            results[0],
            Ok(Command::Connect {
                user: 9,
                role: Role::Driver
            })
        ));
    }

    #[test]
    fn read_returns_error_for_unknown_type() {
        let results = read("teleport,1,,,,,,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedType { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_fields() {
        let results = read("topup,1,,,,,,\naccept,9,,,,,,\nrequest,1,,,43.6,,43.7,-79.4\n");
        let fields: Vec<_> = results
            .iter()
            .map(|r| match r {
                Err(CsvError::Missing { field, .. }) => *field,
                other => panic!("expected missing field, got {other:?}"),
            })
            .collect();
        assert_eq!(fields, ["amount", "ref", "pickup"]);
    }

    #[test]
    fn read_rejects_unrepresentable_amounts() {
        let results = read("topup,1,,1e300,,,,\nwithdraw,9,,NaN,,,,\ntopup,1,,12.34,,,,\n");

        assert!(matches!(
            &results[0],
            Err(CsvError::InvalidAmount { line: 2, kind, .. }) if kind == "topup"
        ));
        assert!(matches!(
            &results[1],
            Err(CsvError::InvalidAmount { line: 3, kind, .. }) if kind == "withdraw"
        ));
        assert!(matches!(
            results[2],
            Ok(Command::TopUp { customer: 1, amount }) if amount == Amount::from_cents(1_234)
        ));
    }

    #[test]
    fn comment_lines_are_skipped() {
        let results = read("# two connections\ndriver,9,,,,,,\n# then a customer\ncustomer,1,,,,,,\n");

        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Ok(Command::Connect {
                user: 1,
                role: Role::Customer
            })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_script(Path::new("/definitely/not/here.csv")),
            Err(CsvError::Open(_))
        ));
    }

    #[test]
    fn wallets_are_written_in_owner_order() {
        let mut driver = Wallet::new(Owner::Driver(9));
        driver.credit(Amount::from_cents(694)).unwrap();
        driver.total_earned = Amount::from_cents(694);
        let mut customer = Wallet::new(Owner::Customer(1));
        customer.credit(Amount::from_cents(3_958)).unwrap();
        let platform = PlatformSummary {
            total_admin_earnings: Amount::from_cents(174),
            ..PlatformSummary::default()
        };

        let mut out = Vec::new();
        write_wallets(&mut out, [driver, customer], platform).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "owner,kind,balance,earned,withdrawn\n\
             1,customer,39.58,0.00,0.00\n\
             9,driver,6.94,6.94,0.00\n\
             platform,platform,1.74,1.74,0.00\n"
        );
    }
}
