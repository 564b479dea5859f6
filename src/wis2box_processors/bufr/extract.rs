// wis2box_processors - Observation processing and publication jobs
//
// Copyright 2024 wis2box_processors authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Station identity, location and time of a single-subset message.

use crate::codec::{double_value, long_value, string_value, MessageHandle};
use crate::outcome::PointGeometry;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use thiserror::Error;

const LATITUDE: &str = "#1#latitude";
const LONGITUDE: &str = "#1#longitude";
const ELEVATION: &str = "#1#heightOfStationGroundAboveMeanSeaLevel";
const TIME_PERIOD: &str = "#1#timePeriod";
const TIME_PERIOD_UNITS: &str = "#1#timePeriod->units";

/// Candidate identifiers read from a subset, neither checked against the station directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationIdentity {
    pub wsi: Option<String>,
    pub tsi: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid date {year}-{month}-{day}T{hour}:{minute}:{second}")]
    Invalid {
        year: i64,
        month: i64,
        day: i64,
        hour: i64,
        minute: i64,
        second: i64,
    },
}

pub fn identity<M: MessageHandle>(msg: &M) -> StationIdentity {
    StationIdentity {
        wsi: wigos_identifier(msg),
        tsi: traditional_identifier(msg),
    }
}

fn wigos_identifier<M: MessageHandle>(msg: &M) -> Option<String> {
    let series = long_value(msg, "#1#wigosIdentifierSeries")?;
    let issuer = long_value(msg, "#1#wigosIssuerOfIdentifier")?;
    let number = long_value(msg, "#1#wigosIssueNumber")?;
    let local = string_value(msg, "#1#wigosLocalIdentifierCharacter")?;

    Some(format!("{}-{}-{}-{}", series, issuer, number, local))
}

fn traditional_identifier<M: MessageHandle>(msg: &M) -> Option<String> {
    if let (Some(block), Some(station)) = (
        long_value(msg, "#1#blockNumber"),
        long_value(msg, "#1#stationNumber"),
    ) {
        return Some(format!("{:02}{:03}", block, station));
    }

    if let Some(callsign) = string_value(msg, "#1#shipOrMobileLandStationIdentifier") {
        return Some(callsign);
    }

    if let (Some(region), Some(area), Some(buoy)) = (
        long_value(msg, "#1#regionNumber"),
        long_value(msg, "#1#wmoRegionSubArea"),
        long_value(msg, "#1#buoyOrPlatformIdentifier"),
    ) {
        return Some(format!("{}{}{:03}", region, area, buoy));
    }

    if let Some(platform) = string_value(msg, "#1#stationaryBuoyPlatformIdentifierEGCManBuoys") {
        return Some(platform);
    }

    long_value(msg, "#1#marineObservingPlatformIdentifier").map(|p| format!("{:07}", p))
}

/// Location of the subset. A missing value on any axis that is present means no
/// location at all, a subset without an elevation element still has a location.
pub fn location<M: MessageHandle>(msg: &M) -> Option<PointGeometry> {
    let latitude = double_value(msg, LATITUDE)?;
    let longitude = double_value(msg, LONGITUDE)?;

    let elevation = if msg.has_key(ELEVATION) {
        Some(double_value(msg, ELEVATION)?)
    } else {
        None
    };

    Some(PointGeometry::new(longitude, latitude, elevation))
}

/// Observation time. Year, month and day are required, the time of day defaults to midnight.
/// A subset reporting a period that starts at that time is stamped with the end of the period.
pub fn observation_time<M: MessageHandle>(msg: &M) -> Result<DateTime<Utc>, TimeError> {
    let year = long_value(msg, "#1#year").ok_or(TimeError::Missing("year"))?;
    let month = long_value(msg, "#1#month").ok_or(TimeError::Missing("month"))?;
    let day = long_value(msg, "#1#day").ok_or(TimeError::Missing("day"))?;
    let hour = long_value(msg, "#1#hour").unwrap_or(0);
    let minute = long_value(msg, "#1#minute").unwrap_or(0);
    let second = long_value(msg, "#1#second").unwrap_or(0);

    let invalid = || TimeError::Invalid {
        year,
        month,
        day,
        hour,
        minute,
        second,
    };

    let field = |v: i64| u32::try_from(v).map_err(|_| invalid());
    let year_field = i32::try_from(year).map_err(|_| invalid())?;

    Utc.with_ymd_and_hms(
        year_field,
        field(month)?,
        field(day)?,
        field(hour)?,
        field(minute)?,
        field(second)?,
    )
    .single()
    .map(|start| period_end(msg, start))
    .ok_or_else(invalid)
}

/// End of the period starting at `start`. Periods ending at `start` (negative) and
/// periods in units other than days, hours, minutes or seconds leave it unchanged.
fn period_end<M: MessageHandle>(msg: &M, start: DateTime<Utc>) -> DateTime<Utc> {
    let period = match long_value(msg, TIME_PERIOD) {
        Some(p) if p > 0 => p,
        _ => return start,
    };

    let length = match string_value(msg, TIME_PERIOD_UNITS).as_deref() {
        Some("d") => TimeDelta::try_days(period),
        Some("h") => TimeDelta::try_hours(period),
        Some("min") => TimeDelta::try_minutes(period),
        Some("s") => TimeDelta::try_seconds(period),
        _ => None,
    };

    length.and_then(|l| start.checked_add_signed(l)).unwrap_or(start)
}
