//! Decoding of MySQL values into JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::mysql::types::MySqlTime;
use sqlx::mysql::{MySqlRow, MySqlValueRef};
use sqlx::types::Json;
use sqlx::{Column, Decode, MySql, Row, TypeInfo, ValueRef};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use time::macros::format_description;

use crate::{Error, Result};

/// Decode one row into an ordered column-name → value map.
pub(crate) fn decode_row(row: &MySqlRow) -> Result<IndexMap<String, JsonValue>> {
   let mut value = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let v = row.try_get_raw(i)?;
      value.insert(column.name().to_string(), to_json(v)?);
   }
   Ok(value)
}

/// Helper to decode MySQL rows to JSON
pub(crate) fn decode_rows(rows: &[MySqlRow]) -> Result<Vec<IndexMap<String, JsonValue>>> {
   rows.iter().map(decode_row).collect()
}

/// Convert a single MySQL value to JSON.
///
/// Integers and floats become numbers, DECIMAL stays a string so no precision
/// is lost, binary data is base64 encoded and temporal types are formatted as
/// ISO-8601 style strings. TIME is a signed duration that may exceed 24
/// hours, so it keeps MySQL's own `[-]HH:MM:SS[.ffffff]` form.
pub fn to_json(value: MySqlValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_info = value.type_info().into_owned();

   let json = match type_info.name() {
      "BOOLEAN" => JsonValue::Bool(decode::<bool>(value)?),

      "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
      | "BIGINT UNSIGNED" => JsonValue::from(decode::<u64>(value)?),

      "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
         JsonValue::from(decode::<i64>(value)?)
      }

      "FLOAT" | "DOUBLE" => serde_json::Number::from_f64(decode::<f64>(value)?)
         .map(JsonValue::Number)
         .unwrap_or(JsonValue::Null),

      "DECIMAL" | "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
      | "SET" => JsonValue::String(decode::<String>(value)?),

      "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
      | "GEOMETRY" => JsonValue::String(BASE64.encode(decode::<Vec<u8>>(value)?)),

      "JSON" => decode::<Json<JsonValue>>(value)?.0,

      "DATE" => formatted(decode::<Date>(value)?.format(format_description!("[year]-[month]-[day]")))?,

      "TIME" => JsonValue::String(format_time(&decode::<MySqlTime>(value)?)),

      "DATETIME" => {
         let dt = decode::<PrimitiveDateTime>(value)?;
         let text = if dt.nanosecond() == 0 {
            dt.format(format_description!(
               "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
         } else {
            dt.format(format_description!(
               "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
            ))
         };
         formatted(text)?
      }

      "TIMESTAMP" => formatted(decode::<OffsetDateTime>(value)?.format(&Rfc3339))?,

      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   Ok(json)
}

fn decode<'r, T: Decode<'r, MySql>>(value: MySqlValueRef<'r>) -> Result<T> {
   T::decode(value).map_err(|e| Error::Sqlx(sqlx::Error::Decode(e)))
}

fn formatted(text: std::result::Result<String, time::error::Format>) -> Result<JsonValue> {
   text
      .map(JsonValue::String)
      .map_err(|e| Error::Other(format!("failed to format temporal value: {}", e)))
}

fn format_time(time: &MySqlTime) -> String {
   let sign = if time.is_negative() { "-" } else { "" };
   let mut text = format!(
      "{sign}{:02}:{:02}:{:02}",
      time.hours(),
      time.minutes(),
      time.seconds()
   );
   if time.microseconds() != 0 {
      text.push_str(&format!(".{:06}", time.microseconds()));
   }
   text
}

#[cfg(test)]
mod tests {
   use sqlx::mysql::types::MySqlTimeSign;

   use super::*;

   #[test]
   fn test_format_time_outside_a_day() {
      let negative = MySqlTime::new(MySqlTimeSign::Negative, 838, 59, 59, 0).unwrap();
      assert_eq!(format_time(&negative), "-838:59:59");

      let fractional = MySqlTime::new(MySqlTimeSign::Positive, 25, 0, 1, 500_000).unwrap();
      assert_eq!(format_time(&fractional), "25:00:01.500000");

      let plain = MySqlTime::new(MySqlTimeSign::Positive, 7, 5, 0, 0).unwrap();
      assert_eq!(format_time(&plain), "07:05:00");
   }
}
