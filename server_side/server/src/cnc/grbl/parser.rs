use {
    super::messages::*,
    common::grbl::GrblState,
    ndarray::Array1,
    nom::{
        branch::alt,
        bytes::complete::{tag, take_until, take_while},
        combinator::{all_consuming, fail, flat_map, map_res, rest, success},
        error::{FromExternalError, ParseError},
        multi::separated_list0,
        sequence::{delimited, preceded, separated_pair, terminated, tuple},
        IResult, Parser,
    },
    std::num::{ParseFloatError, ParseIntError},
};

enum StatusField {
    Feed(f64),
    FeedAndSpindle(f64, f64),
    Buffer(u64, u64),
    WorkCoordinateOffset(Array1<f64>),
    LineNumber(u64),
    Pins(String),
    Overrides(u8, u8, u8),
    Accessories(String),
    Unknown(String),
}
fn apply_status_field(mut status: GrblStatus, field: StatusField) -> GrblStatus {
    match field {
        StatusField::Feed(feed) => status.current_feed = Some(feed),
        StatusField::FeedAndSpindle(feed, spindle) => {
            status.current_feed = Some(feed);
            status.current_spindle = Some(spindle);
        }
        StatusField::Buffer(planner, rx_bytes) => {
            status.planner = Some(planner);
            status.rx_bytes = Some(rx_bytes);
        }
        StatusField::WorkCoordinateOffset(wco) => status.work_coordinate_offset = Some(wco),
        StatusField::LineNumber(line_number) => status.line_number = Some(line_number),
        StatusField::Pins(pins) => status.pins = Some(pins),
        StatusField::Overrides(feed, rapid, spindle) => {
            status.feed_override = Some(feed);
            status.rapid_override = Some(rapid);
            status.spindle_override = Some(spindle);
        }
        StatusField::Accessories(accessories) => status.accessory_state = Some(accessories),
        StatusField::Unknown(unknown) => status.unknown_terms.push(unknown),
    };
    status
}

/*
    Small combinators
*/
fn take_until_through<'a, Error: 'a + ParseError<&'a str>>(
    separator: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    terminated(take_until(separator), tag(separator))
}
fn head_then_rest<'a, Error: 'a + ParseError<&'a str>>(
    separator: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    move |input: &'a str| match input.find(separator) {
        Some(offset) => Ok((&input[offset + separator.len()..], &input[..offset])),
        None => Ok(("", input)),
    }
}
fn enclosed_by<'a, Error: 'a + ParseError<&'a str>>(
    open: &'a str,
    close: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    delimited(tag(open), take_until(close), tag(close))
}
fn non_empty_fields(input: &str, separator: char) -> impl Iterator<Item=&str> {
    input.split(separator).filter(|field| !field.is_empty())
}

fn parse_f64<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, f64, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    map_res(
        take_while(|c: char| c.is_ascii_digit() || c == '.' || c == '-'),
        |substr: &str| substr.parse::<f64>(),
    )
    .parse(input)
}
fn parse_u64<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u64, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    map_res(take_while(|c: char| c.is_ascii_digit()), |substr: &str| {
        substr.parse::<u64>()
    })
    .parse(input)
}
fn parse_u8<'a, Error: 'a + ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u8, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    map_res(take_while(|c: char| c.is_ascii_digit()), |substr: &str| {
        substr.parse::<u8>()
    })
    .parse(input)
}
fn parse_float_array<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Array1<f64>, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    separated_list0(tag(","), parse_f64)
        .map(Array1::from_vec)
        .parse(input)
}

/*
    Status reports: <State|MPos:...|Field:...|...>
*/
fn parse_grbl_state<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblState, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    fn sub_state<'a, Error: 'a + ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>>(
        input: &'a str,
    ) -> IResult<&'a str, i64, Error> {
        alt((preceded(tag(":"), parse_u64.map(|v| v as i64)), success(0))).parse(input)
    }
    all_consuming(flat_map(
        take_while(|c: char| c.is_ascii_alphabetic()),
        |head| -> Box<dyn Parser<&'a str, GrblState, Error>> {
            match head {
                "Idle" => Box::new(success(GrblState::Idle)),
                "Run" => Box::new(success(GrblState::Run)),
                "Hold" => Box::new(sub_state.map(GrblState::Hold)),
                "Jog" => Box::new(success(GrblState::Jog)),
                "Alarm" => Box::new(success(GrblState::Alarm)),
                "Door" => Box::new(sub_state.map(GrblState::Door)),
                "Check" => Box::new(success(GrblState::Check)),
                "Home" => Box::new(success(GrblState::Home)),
                "Sleep" => Box::new(success(GrblState::Sleep)),
                _ => Box::new(fail),
            }
        },
    ))
    .parse(input)
}
fn parse_grbl_position<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblPosition, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
{
    all_consuming(alt((
        preceded(tag("MPos:"), parse_float_array.map(GrblPosition::Machine)),
        preceded(tag("WPos:"), parse_float_array.map(GrblPosition::Work)),
    )))
    .parse(input)
}
fn parse_status_field<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, StatusField, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    all_consuming(flat_map(
        take_until_through(":"),
        |head| -> Box<dyn Parser<&'a str, StatusField, Error>> {
            match head {
                "WCO" => Box::new(parse_float_array.map(StatusField::WorkCoordinateOffset)),
                "Bf" => Box::new(
                    separated_pair(parse_u64, tag(","), parse_u64)
                        .map(|(planner, rx_bytes)| StatusField::Buffer(planner, rx_bytes)),
                ),
                "Ln" => Box::new(parse_u64.map(StatusField::LineNumber)),
                "F" => Box::new(parse_f64.map(StatusField::Feed)),
                "FS" => Box::new(
                    separated_pair(parse_f64, tag(","), parse_f64)
                        .map(|(feed, spindle)| StatusField::FeedAndSpindle(feed, spindle)),
                ),
                "Pn" => Box::new(rest.map(|pins: &str| StatusField::Pins(pins.to_string()))),
                "Ov" => Box::new(
                    tuple((parse_u8, tag(","), parse_u8, tag(","), parse_u8))
                        .map(|(feed, _, rapid, _, spindle)| StatusField::Overrides(feed, rapid, spindle)),
                ),
                "A" => Box::new(rest.map(|accessories: &str| StatusField::Accessories(accessories.to_string()))),
                _ => Box::new(fail),
            }
        },
    ))
    .or(rest.map(|input: &str| StatusField::Unknown(input.to_string())))
    .parse(input)
}
fn parse_grbl_status<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblStatus, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let (remaining, body) = enclosed_by("<", ">").parse(input)?;
    let (body, state) = head_then_rest("|").and_then(parse_grbl_state).parse(body)?;
    let (body, position) = head_then_rest("|").and_then(parse_grbl_position).parse(body)?;
    let mut status = GrblStatus::new(state, position);
    for field in non_empty_fields(body, '|') {
        let (_, field) = parse_status_field(field)?;
        status = apply_status_field(status, field);
    }
    Ok((remaining, status))
}

/*
    Everything else
*/
fn parse_grbl_square_brackets<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblMessage, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    let probe = preceded(
        tag("PRB:"),
        separated_pair(parse_float_array, tag(":"), parse_u64.map(|u| u != 0)),
    )
    .map(|(position, success)| GrblMessage::ProbeEvent(ProbeEvent { success, position }));
    enclosed_by("[", "]")
        .and_then(all_consuming(alt((
            probe,
            rest.map(|feedback: &str| GrblMessage::Feedback(feedback.to_string())),
        ))))
        .parse(input)
}
fn parse_grbl_ok<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblMessage, Error> {
    tag("ok").map(|_| GrblMessage::GrblOk).parse(input)
}
fn parse_grbl_error<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblMessage, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    preceded(tag("error:"), parse_u64)
        .map(GrblMessage::GrblError)
        .parse(input)
}
fn parse_grbl_alarm<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblMessage, Error>
where
    Error: FromExternalError<&'a str, ParseIntError>,
{
    preceded(tag("ALARM:"), parse_u64)
        .map(GrblMessage::GrblAlarm)
        .parse(input)
}
fn parse_grbl_greeting<'a, Error: 'a + ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, GrblMessage, Error> {
    tag("Grbl ")
        .and(rest)
        .map(|_| GrblMessage::GrblGreeting)
        .parse(input)
}
fn parse_grbl_line_impl<'a, Error: 'a + ParseError<&'a str>>(
    message: &'a str,
) -> IResult<&'a str, GrblMessage, Error>
where
    Error: FromExternalError<&'a str, ParseFloatError>,
    Error: FromExternalError<&'a str, ParseIntError>,
{
    alt((
        all_consuming(parse_grbl_status.map(GrblMessage::StatusEvent)),
        all_consuming(parse_grbl_square_brackets),
        all_consuming(parse_grbl_ok),
        all_consuming(parse_grbl_error),
        all_consuming(parse_grbl_alarm),
        parse_grbl_greeting,
    ))
    .parse(message)
}
pub fn parse_grbl_line(message: &str) -> GrblMessage {
    let message = message.trim_end_matches(['\r', '\n']);
    match parse_grbl_line_impl::<()>(message) {
        Ok((_, parsed)) => parsed,
        Err(_) => GrblMessage::Unrecognized(message.to_string()),
    }
}
