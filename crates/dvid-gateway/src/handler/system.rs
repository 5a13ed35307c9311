use dvid_core::messages::{EchoRequest, EchoResponse};
use dvid_core::{DownstreamType, UpstreamPayload, UpstreamType};

use crate::route::{decode_as, handler, Request, Response, RouteTable};

pub(super) fn register(routes: &mut RouteTable) {
    routes.register(
        UpstreamType::Echo,
        DownstreamType::Echo,
        decode_as::<EchoRequest>,
        handler(echo),
    );
}

async fn echo(req: Request) -> Response {
    let UpstreamPayload::Echo(echo) = req.payload else {
        return Response::internal();
    };
    Response::ok(EchoResponse {
        content: echo.content,
    })
}
