/// Base types every site compiles against.
pub const FOUNDATION_FILE: &str = "<foundation>/kiln.ks";

pub const FOUNDATION_SOURCE: &str = r#"namespace Kiln
{
    public class Handler
    {
        public virtual void ProcessRequest()
        {
            Render();
        }

        public virtual void Render()
        {
        }
    }

    public class Page : Handler
    {
        public override void ProcessRequest()
        {
            Response.ContentType("text/html; charset=utf-8");
            Render();
        }
    }
}
"#;
